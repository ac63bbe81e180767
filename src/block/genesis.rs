//! Genesis headers for the supported networks.

use super::header::{BlockHeader, BASE_HEADER_LEN};
use crate::network_type::NetworkType;

const MAINNET_GENESIS_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";
const TESTNET_GENESIS_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff001d1aa4ae18";
const REGTEST_GENESIS_HEX: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4adae5494dffff7f2002000000";

pub fn genesis_header_hex(network: NetworkType) -> &'static str {
    match network {
        NetworkType::Mainnet => MAINNET_GENESIS_HEX,
        NetworkType::Testnet => TESTNET_GENESIS_HEX,
        NetworkType::Regtest => REGTEST_GENESIS_HEX,
    }
}

pub fn genesis_header(network: NetworkType) -> BlockHeader {
    // Constants above are 80 well-formed bytes; covered by test_genesis_hashes_match.
    match BlockHeader::from_hex(genesis_header_hex(network), BASE_HEADER_LEN) {
        Ok(header) => header,
        Err(e) => unreachable!("built-in genesis header is malformed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hashes_match() {
        for net in [NetworkType::Mainnet, NetworkType::Testnet, NetworkType::Regtest] {
            assert_eq!(
                genesis_header(net).block_hash().to_string(),
                net.genesis_hash(),
                "genesis mismatch for {}",
                net
            );
        }
    }
}
