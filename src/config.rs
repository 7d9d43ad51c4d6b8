//! Configuration options for the framing engine

/// Per-connection protocol configuration.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolConfig {
    /// Mask outgoing payloads with a fresh key per frame.
    ///
    /// The protocol mandates masking for frames originating from a client;
    /// servers send unmasked.
    pub mask_outgoing: bool,
    /// Answer non-upgrade HTTP requests with 426 instead of passing them
    /// through to the regular HTTP stack
    pub require_upgrade: bool,
}

impl ProtocolConfig {
    /// Server-side defaults: unmasked replies, upgrades optional
    pub fn server() -> Self {
        Self {
            mask_outgoing: false,
            require_upgrade: false,
        }
    }

    /// Client-side defaults: masked frames, as the protocol requires
    pub fn client() -> Self {
        Self {
            mask_outgoing: true,
            require_upgrade: false,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::server()
    }
}
