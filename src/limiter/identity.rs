//! Client identification for rate limiting.

/// Key used when a request carries no usable client information.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// What the transport layer knows about the caller.
///
/// The forwarding header is trivially spoofable, so it is only honoured
/// when the deployment sits behind a proxy that sets it (see
/// [`key()`](Self::key)).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Raw `X-Forwarded-For` header value, if any.
    pub forwarded_for: Option<String>,
    /// Address of the directly connected peer, if any.
    pub peer_addr: Option<String>,
}

impl ClientIdentity {
    /// Identity from the direct peer only.
    pub fn peer(addr: impl Into<String>) -> Self {
        Self {
            forwarded_for: None,
            peer_addr: Some(addr.into()),
        }
    }

    /// Attach a forwarding header value.
    pub fn forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }

    /// Derive the bucket key.
    ///
    /// With `trust_forwarded`, the first entry of the forwarding header wins.
    /// Otherwise (or when that entry is blank) the peer address is used,
    /// falling back to [`UNKNOWN_CLIENT`].
    pub fn key(&self, trust_forwarded: bool) -> String {
        let forwarded = self
            .forwarded_for
            .as_deref()
            .filter(|_| trust_forwarded)
            .and_then(|header| header.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty());

        let peer = self
            .peer_addr
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty());

        forwarded.or(peer).unwrap_or(UNKNOWN_CLIENT).to_owned()
    }
}
