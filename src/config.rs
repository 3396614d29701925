//! Whole-network configuration.
//!
//! A [`NetConfig`] is the serializable description of a network: block
//! shapes, initial ranks, rank bounds, activations and the init seed. With the
//! `serde` feature it round-trips through a versioned JSON document.
//!
//! Trained factors are not part of the format; a config always rebuilds a
//! freshly initialized network.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "serde")]
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::{BlockConfig, DlraNet, Error, Result};

pub const CONFIG_FORMAT_VERSION: u32 = 1;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    pub format_version: u32,
    /// Seed for basis and coupling initialization.
    pub seed: u64,
    pub blocks: Vec<BlockConfig>,
}

impl NetConfig {
    pub fn new(seed: u64, blocks: Vec<BlockConfig>) -> Self {
        Self {
            format_version: CONFIG_FORMAT_VERSION,
            seed,
            blocks,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_version != CONFIG_FORMAT_VERSION {
            return Err(Error::InvalidConfig(format!(
                "unsupported config format_version {}; expected {}",
                self.format_version, CONFIG_FORMAT_VERSION
            )));
        }
        if self.blocks.is_empty() {
            return Err(Error::InvalidConfig(
                "network config must have at least one block".to_owned(),
            ));
        }

        for (i, block) in self.blocks.iter().enumerate() {
            block
                .validate()
                .map_err(|e| Error::InvalidConfig(format!("block {i} invalid: {e}")))?;

            if i > 0 {
                let prev_out = self.blocks[i - 1].out_dim;
                if block.in_dim != prev_out {
                    return Err(Error::InvalidConfig(format!(
                        "block {i} in_dim {} does not match previous out_dim {prev_out}",
                        block.in_dim
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate and initialize the network.
    pub fn build(&self) -> Result<DlraNet> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        DlraNet::from_configs(&self.blocks, &mut rng)
    }
}

#[cfg(feature = "serde")]
impl NetConfig {
    /// Serialize to a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidData(format!("failed to serialize config: {e}")))
    }

    /// Serialize to a compact JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::InvalidData(format!("failed to serialize config: {e}")))
    }

    /// Parse and validate a config from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: NetConfig = serde_json::from_str(s)
            .map_err(|e| Error::InvalidData(format!("failed to parse config json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save the config to a JSON file (pretty-printed).
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let s = self.to_json_string_pretty()?;
        let p = path.as_ref();
        std::fs::write(p, s)
            .map_err(|e| Error::InvalidData(format!("failed to write {}: {e}", p.display())))?;
        Ok(())
    }

    /// Load a config from a JSON file.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::InvalidData(format!("failed to read {}: {e}", p.display())))?;
        Self::from_json_str(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{Activation, Init};

    fn blocks() -> Vec<BlockConfig> {
        let mut first = BlockConfig::new(4, 6, 2);
        first.activation = Activation::Tanh;
        let mut second = BlockConfig::new(6, 3, 1);
        second.init = Init::Zeros;
        vec![first, second]
    }

    #[test]
    fn build_is_deterministic_in_the_seed() {
        let cfg = NetConfig::new(3, blocks());
        let a = cfg.build().unwrap();
        let b = cfg.build().unwrap();
        assert_eq!(a.blocks()[0].factor(), b.blocks()[0].factor());
        assert_eq!(a.ranks(), vec![2, 1]);
    }

    #[test]
    fn rejects_broken_chain_and_version() {
        let mut bad = blocks();
        bad[1].in_dim = 5;
        assert!(NetConfig::new(0, bad).validate().is_err());

        let mut cfg = NetConfig::new(0, blocks());
        cfg.format_version = 99;
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err}").contains("format_version"));

        assert!(NetConfig::new(0, Vec::new()).build().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_roundtrips() {
        let cfg = NetConfig::new(7, blocks());
        let json = cfg.to_json_string_pretty().unwrap();
        assert!(json.contains("\"kind\": \"tanh\""));
        assert_eq!(NetConfig::from_json_str(&json).unwrap(), cfg);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_rejects_invalid_rank_bounds() {
        let json = r#"{
            "format_version": 1,
            "seed": 0,
            "blocks": [{
                "in_dim": 4, "out_dim": 4, "rank": 3, "tolerance": 0.1,
                "rmax_total": 2, "activation": {"kind": "relu"}, "init": "he"
            }]
        }"#;
        assert!(matches!(
            NetConfig::from_json_str(json),
            Err(Error::InvalidConfig(_))
        ));
    }
}
