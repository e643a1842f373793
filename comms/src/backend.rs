use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The collective communication backend a process group runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// CPU collectives.
    #[default]
    Gloo,
    /// Accelerator collectives, requires accelerator devices.
    Nccl,
    /// Ring all-reduce driven by an external launcher.
    Horovod,
}

impl Backend {
    /// Whether this build can run the backend at all.
    ///
    /// # Returns
    /// `false` for backends that need accelerator devices.
    pub fn is_available(&self) -> bool {
        !matches!(self, Backend::Nccl)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Backend::Gloo => "gloo",
            Backend::Nccl => "nccl",
            Backend::Horovod => "horovod",
        };

        f.write_str(s)
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gloo" => Ok(Backend::Gloo),
            "nccl" => Ok(Backend::Nccl),
            "horovod" => Ok(Backend::Horovod),
            _ => Err(format!(
                "unknown backend {s:?}, valid options: gloo, nccl, horovod"
            )),
        }
    }
}
