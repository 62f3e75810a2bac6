use std::fmt;
use std::str::FromStr;

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Query/key feature map applied per head before the slot recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FeatureMapKind {
    #[default]
    Swish,
    Relu,
    /// ReLU over a learned square projection
    T2r,
}

impl FromStr for FeatureMapKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "swish" => Ok(Self::Swish),
            "relu" => Ok(Self::Relu),
            "t2r" => Ok(Self::T2r),
            _ => Err(Error::UnsupportedFeatureMap(s.to_string())),
        }
    }
}

impl TryFrom<String> for FeatureMapKind {
    type Error = Error;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FeatureMapKind> for String {
    fn from(kind: FeatureMapKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for FeatureMapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Swish => write!(f, "swish"),
            Self::Relu => write!(f, "relu"),
            Self::T2r => write!(f, "t2r"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FeatureMap {
    Swish,
    Relu,
    T2r(Linear),
}

impl FeatureMap {
    pub fn new(kind: FeatureMapKind, head_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match kind {
            FeatureMapKind::Swish => Self::Swish,
            FeatureMapKind::Relu => Self::Relu,
            FeatureMapKind::T2r => Self::T2r(linear_no_bias(head_dim, head_dim, vb.pp("layer"))?),
        })
    }
}

impl Module for FeatureMap {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Swish => candle_nn::ops::silu(x),
            Self::Relu => x.relu(),
            Self::T2r(layer) => layer.forward(x)?.relu(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_map_kind_from_str() {
        assert_eq!("t2r".parse::<FeatureMapKind>().unwrap(), FeatureMapKind::T2r);
        assert_eq!("Swish".parse::<FeatureMapKind>().unwrap(), FeatureMapKind::Swish);
        assert!(matches!(
            "hedgehog".parse::<FeatureMapKind>(),
            Err(Error::UnsupportedFeatureMap(name)) if name == "hedgehog"
        ));
    }

    #[test]
    fn test_feature_map_kind_yaml() {
        let kind: FeatureMapKind = serde_yaml::from_str("relu").unwrap();
        assert_eq!(kind, FeatureMapKind::Relu);
        assert!(serde_yaml::from_str::<FeatureMapKind>("elu").is_err());
    }
}
