use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The backend tasks are registered against.
///
/// Only the host CPU is supported. It is named `llvm` in tuning logs so that
/// records line up with the target strings other tuning tools write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TargetId {
    #[default]
    #[serde(rename = "llvm")]
    #[cfg_attr(feature = "clap", value(name = "llvm"))]
    Llvm,
}

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("Unknown target: {0}")]
pub struct UnknownTarget(String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Llvm => write!(f, "llvm"),
        }
    }
}

impl FromStr for TargetId {
    type Err = UnknownTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llvm" => Ok(TargetId::Llvm),
            _ => Err(UnknownTarget(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_string_roundtrip() {
        assert_eq!(TargetId::Llvm.to_string(), "llvm");
        assert_eq!("llvm".parse::<TargetId>(), Ok(TargetId::Llvm));
        assert!("cuda".parse::<TargetId>().is_err());
    }
}
