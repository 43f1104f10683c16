use serde::{Deserialize, Serialize};

/// CPU architecture suffix of a `dyld_shared_cache_{arch}` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// Pointer-authenticated arm64 (modern iPhone/iPad/Apple Silicon).
    Arm64e,
    /// Plain arm64.
    Arm64,
    /// Watch-class arm64 with 32-bit pointers.
    #[serde(rename = "arm64_32")]
    Arm64_32,
    /// Legacy 32-bit ARM.
    Armv7,
    /// Legacy watch ARM.
    Armv7k,
    /// Legacy 32-bit ARM (s variant).
    Armv7s,
    /// Intel Macs.
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Arch {
    /// All architectures, in DSC search order.
    pub const ALL: [Arch; 7] = [
        Arch::Arm64e,
        Arch::Arm64,
        Arch::Arm64_32,
        Arch::Armv7,
        Arch::Armv7k,
        Arch::Armv7s,
        Arch::X86_64,
    ];

    /// The suffix as it appears in DSC file names and `ipsw -a` flags.
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Arm64e => "arm64e",
            Arch::Arm64 => "arm64",
            Arch::Arm64_32 => "arm64_32",
            Arch::Armv7 => "armv7",
            Arch::Armv7k => "armv7k",
            Arch::Armv7s => "armv7s",
            Arch::X86_64 => "x86_64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Arch::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown architecture: '{s}'"))
    }
}
