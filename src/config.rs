use std::net::IpAddr;
use std::path::PathBuf;

/// Construction parameters for a [`crate::node::Node`].
///
/// Device name and outbound IP are resolved once (spec §9: "memoized at
/// process start... should be injected into the Node at construction
/// rather than read from globals, so tests can instantiate two engines in
/// one process") and passed in here rather than read from process-wide
/// state.
pub struct EngineConfig {
    /// This instance's device name, e.g. `laptop-4711` or `peer-839201` in
    /// debug mode.
    pub device_name: String,

    /// The outbound IP other peers should dial us on.
    pub ip: IpAddr,

    /// TCP port for both the mDNS identity and the signalling listener.
    /// `0` asks the OS for an unused port (see [`crate::identity::ephemeral_port`]).
    pub signalling_port: u16,

    /// Directory incoming files are written into.
    pub download_dir: PathBuf,
}

impl EngineConfig {
    pub fn new(device_name: impl Into<String>, ip: IpAddr, download_dir: PathBuf) -> Self {
        Self { device_name: device_name.into(), ip, signalling_port: 0, download_dir }
    }

    pub fn with_signalling_port(mut self, port: u16) -> Self {
        self.signalling_port = port;
        self
    }
}
