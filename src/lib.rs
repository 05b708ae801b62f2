// UnoBench - Interactive Arduino UNO Sketch Simulator Host
// Build orchestration, per-session child process supervision, session
// multiplexing, and the sideband event protocol.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod pins;
pub mod protocol;
pub mod reducer;
pub mod runner;
pub mod server;
pub mod session;
pub mod sketch;
pub mod toolchain;

#[cfg(test)]
mod tests;

/// Bundled Arduino mock runtime, prepended above every merged sketch.
/// An opaque asset as far as the host is concerned; the contract is the
/// sideband protocol it speaks.
pub const ARDUINO_RUNTIME: &str = include_str!("../assets/arduino_runtime.cpp");

/// The runtime source actually used: the bundled asset, unless the
/// configuration points at an override file.
pub fn load_runtime_source(config: &config::ServerConfig) -> anyhow::Result<String> {
    match &config.runtime_source {
        Some(path) => {
            log::info!("using runtime override from {}", path.display());
            Ok(std::fs::read_to_string(path)?)
        }
        None => Ok(ARDUINO_RUNTIME.to_string()),
    }
}
