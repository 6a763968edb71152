//! Record shapes and IPC protocol types for logit-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! Program and Session are the persisted row shapes; the request/response
//! envelope is the local read surface the daemon exposes over its socket.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Subject a catalog entry belongs to. Not used for any monitoring logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRole {
    Backend,
    Frontend,
    System,
}

impl OwnerRole {
    pub fn owner_id(self) -> i64 {
        match self {
            OwnerRole::Backend => 1,
            OwnerRole::Frontend => 2,
            OwnerRole::System => 3,
        }
    }
}

/// Catalog entry for one distinct monitored application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub program_id: i64,
    pub program_name: String,
    pub first_seen: DateTime<Utc>,
    pub owner_id: i64,
}

/// One contiguous run of a program's process.
///
/// `end_time == None` means the session is open. `duration_ms` is refreshed
/// while open and frozen at `end_time - start_time` once closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: i64,
    pub program_id: i64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub session_number: u32,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramWithSessions {
    #[serde(flatten)]
    pub program: Program,
    pub sessions: Vec<Session>,
}

/// Live entry in the monitor's tracked-process map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub pid: u32,
    pub program_name: String,
    pub session: Session,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    ListPrograms,
    GetProgramSessions,
    GetTracked,
    AppendSession,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ListProgramsParams {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramSessionsParams {
    pub program_id: i64,
}

/// Manually recorded session for an existing program.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppendSessionParams {
    pub program_id: i64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

impl AppendSessionParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_program_id(self.program_id)?;

        if let Some(end_time) = self.end_time {
            if end_time < self.start_time {
                return Err(ErrorInfo::new(
                    "invalid_params",
                    "end_time must not precede start_time",
                ));
            }
        }

        if let Some(duration_ms) = self.duration_ms {
            if duration_ms < 0 {
                return Err(ErrorInfo::new(
                    "invalid_params",
                    "duration_ms must not be negative",
                ));
            }
        }

        Ok(())
    }

    /// Duration to store: explicit value, else derived from the end time, else zero.
    pub fn effective_duration_ms(&self) -> i64 {
        match (self.duration_ms, self.end_time) {
            (Some(duration_ms), _) => duration_ms,
            (None, Some(end_time)) => (end_time - self.start_time).num_milliseconds(),
            (None, None) => 0,
        }
    }
}

pub fn parse_list_programs(params: Option<Value>) -> Result<ListProgramsParams, ErrorInfo> {
    match params {
        Some(params) => serde_json::from_value(params).map_err(|err| {
            ErrorInfo::new("invalid_params", format!("list_programs params invalid: {}", err))
        }),
        None => Ok(ListProgramsParams::default()),
    }
}

pub fn parse_program_sessions(params: Value) -> Result<ProgramSessionsParams, ErrorInfo> {
    let parsed: ProgramSessionsParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("get_program_sessions params invalid: {}", err),
        )
    })?;
    require_program_id(parsed.program_id)?;
    Ok(parsed)
}

pub fn parse_append_session(params: Value) -> Result<AppendSessionParams, ErrorInfo> {
    let parsed: AppendSessionParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("append_session payload is invalid JSON: {}", err),
        )
    })?;
    parsed.validate()?;
    Ok(parsed)
}

fn require_program_id(program_id: i64) -> Result<(), ErrorInfo> {
    if program_id <= 0 {
        return Err(ErrorInfo::new("invalid_program_id", "program_id is required"));
    }
    Ok(())
}
