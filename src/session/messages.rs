// WebSocket Frame Types
// Tagged JSON frames in both directions. Deserialization is the schema
// boundary: a frame that does not parse into Inbound is logged and
// dropped without closing the connection.

use crate::analyzer::Advisory;
use crate::pins::{PinMode, PinRecord};
use crate::runner::SimStatus;
use crate::sketch::HeaderTab;
use serde::{Deserialize, Serialize};

/// Frames accepted from the peer
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Compile {
        code: String,
        #[serde(default)]
        headers: Vec<HeaderTab>,
    },
    StartSimulation {
        /// Simulation timeout in seconds; 0 = run until stopped
        #[serde(default)]
        timeout: Option<u64>,
    },
    StopSimulation,
    PauseSimulation,
    ResumeSimulation,
    SerialInput {
        payload: String,
    },
    SetPinValue {
        pin: String,
        value: i32,
    },
    CodeChanged,
}

/// Compile phases surfaced through compilation_status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilePhase {
    Compiling,
    Success,
    Error,
}

/// Frames sent to peers. Compilation status is broadcast; everything else
/// is unicast to the owning session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    CompilationStatus {
        status: CompilePhase,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        errors: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        parser_messages: Option<Vec<Advisory>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        io_registry: Option<Vec<PinRecord>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        processed_code: Option<String>,
    },
    CompilationError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        errors: Option<String>,
    },
    SimulationStatus {
        status: SimStatus,
    },
    /// Legacy raw serial line from the child's stdout
    SerialOutput {
        text: String,
    },
    /// Structured serial bytes; payload is base64
    SerialEvent {
        ts_write: u64,
        payload: String,
    },
    PinState {
        pin: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        mode: Option<PinMode>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        value: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pwm: Option<u8>,
    },
    IoRegistry {
        pins: Vec<PinRecord>,
    },
}
