use thiserror::Error;

/// Error codes reported by the sound server. Code `0` means success and has no variant.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServerError {
    #[error("Access denied")]
    Access = 1,
    #[error("Unknown command")]
    Command = 2,
    #[error("Invalid argument")]
    Invalid = 3,
    #[error("Entity exists")]
    Exist = 4,
    #[error("No such entity")]
    NoEntity = 5,
    #[error("Connection refused")]
    ConnectionRefused = 6,
    #[error("Protocol error")]
    Protocol = 7,
    #[error("Timeout")]
    Timeout = 8,
    #[error("No authentication key")]
    AuthKey = 9,
    #[error("Internal error")]
    Internal = 10,
    #[error("Connection terminated")]
    ConnectionTerminated = 11,
    #[error("Entity killed")]
    Killed = 12,
    #[error("Invalid server")]
    InvalidServer = 13,
    #[error("Module initialization failed")]
    ModInitFailed = 14,
    #[error("Bad state")]
    BadState = 15,
    #[error("No data")]
    NoData = 16,
    #[error("Incompatible protocol version")]
    Version = 17,
    #[error("Too large")]
    TooLarge = 18,
}

impl ServerError {
    pub const ALL: [ServerError; 18] = [
        ServerError::Access,
        ServerError::Command,
        ServerError::Invalid,
        ServerError::Exist,
        ServerError::NoEntity,
        ServerError::ConnectionRefused,
        ServerError::Protocol,
        ServerError::Timeout,
        ServerError::AuthKey,
        ServerError::Internal,
        ServerError::ConnectionTerminated,
        ServerError::Killed,
        ServerError::InvalidServer,
        ServerError::ModInitFailed,
        ServerError::BadState,
        ServerError::NoData,
        ServerError::Version,
        ServerError::TooLarge,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    /// `Ok(None)` for code 0, `Err(code)` for codes outside the known range.
    pub fn from_code(code: u32) -> Result<Option<ServerError>, u32> {
        if code == 0 {
            return Ok(None);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.code() == code)
            .map(Some)
            .ok_or(code)
    }
}
