//! Network configuration: the [`Rules`] an epoch runs with, the protocol
//! [`Upgrades`] they switch on, and the [`Genesis`] a network starts from.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod constants;

pub mod genesis;
pub use genesis::{Genesis, GenesisAccount, GenesisError, SignedGenesis};

pub mod hardfork;
pub use hardfork::{Upgrade, Upgrades};

pub mod rules;
pub use rules::{Rules, RulesError};
