//! Sonic protocol upgrades.
//!
//! Unlike time-activated Ethereum forks, upgrades are flags in the network
//! [`Rules`](crate::Rules) and therefore switch on at epoch boundaries only.
//!
//! ## Adding a New Upgrade
//!
//! 1. Add a variant to [`Upgrade`], after the latest one.
//! 2. Add the flag to [`Upgrades`] and check it first in [`Upgrades::latest`].
//! 3. Require its predecessor in [`Upgrades::validate`].
//! 4. Extend the `is_*` tests.

use serde::{Deserialize, Serialize};

/// Named protocol upgrades, in activation order.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Upgrade {
    /// Baseline rules: 10% of unused gas is charged.
    #[default]
    Sonic,
    /// EIP-7623 floor data cost.
    Allegro,
    /// EIP-7883 modexp pricing, EIP-7823 length caps and the P-256 precompile.
    Brio,
}

impl Upgrade {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sonic => "Sonic",
            Self::Allegro => "Allegro",
            Self::Brio => "Brio",
        }
    }

    pub fn is_allegro(&self) -> bool {
        *self >= Self::Allegro
    }

    pub fn is_brio(&self) -> bool {
        *self >= Self::Brio
    }
}

/// Upgrade flags of an epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Upgrades {
    pub sonic: bool,
    pub allegro: bool,
    pub brio: bool,
    /// Blocks are built by one elected validator instead of from all decided events.
    pub single_proposer_block_formation: bool,
}

impl Upgrades {
    pub const fn sonic() -> Self {
        Self {
            sonic: true,
            allegro: false,
            brio: false,
            single_proposer_block_formation: false,
        }
    }

    pub const fn allegro() -> Self {
        Self {
            allegro: true,
            ..Self::sonic()
        }
    }

    pub const fn brio() -> Self {
        Self {
            brio: true,
            ..Self::allegro()
        }
    }

    pub const fn with_single_proposer(self) -> Self {
        Self {
            single_proposer_block_formation: true,
            ..self
        }
    }

    /// Latest upgrade switched on by these flags.
    pub const fn latest(&self) -> Upgrade {
        if self.brio {
            Upgrade::Brio
        } else if self.allegro {
            Upgrade::Allegro
        } else {
            Upgrade::Sonic
        }
    }

    /// Parses a `+`-separated list such as `sonic+allegro+single-proposer`.
    pub fn parse_list(list: &str) -> Result<Self, String> {
        let mut upgrades = Self::default();
        for name in list.split('+').map(str::trim).filter(|s| !s.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "sonic" => upgrades.sonic = true,
                "allegro" => upgrades.allegro = true,
                "brio" => upgrades.brio = true,
                "single-proposer" | "singleproposer" => {
                    upgrades.single_proposer_block_formation = true
                }
                other => return Err(format!("unknown upgrade `{other}`")),
            }
        }
        Ok(upgrades)
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if !self.sonic {
            return Err("the Sonic upgrade is mandatory");
        }
        if self.brio && !self.allegro {
            return Err("Brio requires Allegro");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_allegro() {
        assert!(!Upgrade::Sonic.is_allegro());
        assert!(Upgrade::Allegro.is_allegro());
        assert!(Upgrade::Brio.is_allegro());
    }

    #[test]
    fn test_is_brio() {
        assert!(!Upgrade::Sonic.is_brio());
        assert!(!Upgrade::Allegro.is_brio());
        assert!(Upgrade::Brio.is_brio());
    }

    #[test]
    fn latest_follows_flags() {
        assert_eq!(Upgrades::sonic().latest(), Upgrade::Sonic);
        assert_eq!(Upgrades::allegro().latest(), Upgrade::Allegro);
        assert_eq!(Upgrades::brio().with_single_proposer().latest(), Upgrade::Brio);
    }

    #[test]
    fn parses_lists() {
        assert_eq!(
            Upgrades::parse_list("sonic+allegro+single-proposer").unwrap(),
            Upgrades::allegro().with_single_proposer()
        );
        assert!(Upgrades::parse_list("sonic+london").is_err());
    }

    #[test]
    fn brio_without_allegro_is_invalid() {
        let upgrades = Upgrades {
            brio: true,
            ..Upgrades::sonic()
        };
        assert!(upgrades.validate().is_err());
    }

    #[test]
    fn test_upgrades_serde() {
        let json = serde_json::to_string(&Upgrades::allegro()).unwrap();
        assert_eq!(
            json,
            r#"{"Sonic":true,"Allegro":true,"Brio":false,"SingleProposerBlockFormation":false}"#
        );
        let deserialized: Upgrades = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, Upgrades::allegro());
        assert_eq!(serde_json::to_string(&Upgrade::Brio).unwrap(), "\"Brio\"");
    }
}
