//! Server error codes to [`ErrorKind`].

use crate::error::ErrorKind;
use crate::server::ServerError;

pub fn translate(error: ServerError) -> ErrorKind {
    match error {
        ServerError::Access | ServerError::AuthKey => ErrorKind::Access,
        ServerError::Invalid | ServerError::InvalidServer => ErrorKind::Invalid,
        ServerError::NoEntity => ErrorKind::NotFound,
        ServerError::ConnectionRefused => ErrorKind::NotAvailable,
        ServerError::Killed => ErrorKind::Destroyed,
        ServerError::ModInitFailed => ErrorKind::NoDriver,
        ServerError::BadState => ErrorKind::State,
        ServerError::Version => ErrorKind::NotSupported,
        ServerError::TooLarge => ErrorKind::TooBig,
        ServerError::Command
        | ServerError::Exist
        | ServerError::Protocol
        | ServerError::Timeout
        | ServerError::Internal
        | ServerError::ConnectionTerminated
        | ServerError::NoData => ErrorKind::IO,
    }
}

/// Total over the code space: `0` is success, unknown codes are `IO`.
pub fn translate_code(code: u32) -> Result<(), ErrorKind> {
    match ServerError::from_code(code) {
        Ok(None) => Ok(()),
        Ok(Some(error)) => Err(translate(error)),
        Err(_) => Err(ErrorKind::IO),
    }
}

/// For codes read after a failure was already observed; `0` still yields `IO`.
pub fn errno_kind(code: u32) -> ErrorKind {
    translate_code(code).err().unwrap_or(ErrorKind::IO)
}

impl From<ServerError> for ErrorKind {
    fn from(error: ServerError) -> Self {
        translate(error)
    }
}
