use serde::{Deserialize, Serialize};

/// Serialized header size shared by every Bitcoin-family network we speak to.
pub const BITCOIN_HEADER_SIZE: usize = 80;

/// Difficulty retarget period; ElectrumX caps `blockchain.block.headers` at this many.
pub const RETARGET_CHUNK: usize = 2016;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkType {
    /// Genesis block hash in display (byte-reversed) hex.
    pub fn genesis_hash(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => {
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
            }
            NetworkType::Testnet => {
                "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
            }
            NetworkType::Regtest => {
                "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
            }
        }
    }

    /// Checkpoint below which headers are neither stored nor verified.
    /// Always a multiple of the retarget chunk so bulk requests stay aligned.
    pub fn default_start_point(&self) -> u64 {
        match self {
            NetworkType::Mainnet => 800_352, // 397 * 2016
            NetworkType::Testnet => 2_499_840, // 1240 * 2016
            NetworkType::Regtest => 0,
        }
    }

    pub fn header_size(&self) -> usize {
        BITCOIN_HEADER_SIZE
    }

    pub fn chunk_size(&self) -> usize {
        RETARGET_CHUNK
    }

    pub fn default_tcp_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 50001,
            NetworkType::Testnet => 60001,
            NetworkType::Regtest => 50001,
        }
    }

    pub fn default_tls_port(&self) -> u16 {
        match self {
            NetworkType::Mainnet => 50002,
            NetworkType::Testnet => 60002,
            NetworkType::Regtest => 50002,
        }
    }

    /// A transaction every honest server for this network can serve.
    /// Used to reject servers running without a transaction index.
    pub fn canary_txid(&self) -> Option<&'static str> {
        match self {
            // First peer-to-peer transfer (block 170)
            NetworkType::Mainnet => {
                Some("f4184fc596403b9d638783cf57adfe4c75c605f6356fbc91338530e9831e9e16")
            }
            NetworkType::Testnet | NetworkType::Regtest => None,
        }
    }

    pub fn data_subdir(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Regtest => "regtest",
        }
    }
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(NetworkType::Mainnet),
            "testnet" | "test" | "testnet3" => Ok(NetworkType::Testnet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkType::Mainnet => write!(f, "Mainnet"),
            NetworkType::Testnet => write!(f, "Testnet"),
            NetworkType::Regtest => write!(f, "Regtest"),
        }
    }
}
