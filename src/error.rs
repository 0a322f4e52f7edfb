use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Amqp(lapin::Error),
    Arrow(arrow::error::ArrowError),
    Json(serde_json::Error),
    Expr(crate::expr::ExprError),
    Config(String),
    InvalidTimestamp(String),
    IdleTimeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Amqp(err) => write!(f, "amqp error: {err}"),
            Error::Arrow(err) => write!(f, "arrow error: {err}"),
            Error::Json(err) => write!(f, "json error: {err}"),
            Error::Expr(err) => write!(f, "expression error: {err}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::InvalidTimestamp(value) => write!(f, "invalid timestamp: {value}"),
            Error::IdleTimeout => write!(f, "no events emitted within the idle timeout"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Amqp(err) => Some(err),
            Error::Arrow(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::Expr(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<lapin::Error> for Error {
    fn from(value: lapin::Error) -> Self {
        Error::Amqp(value)
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(value: arrow::error::ArrowError) -> Self {
        Error::Arrow(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(value)
    }
}

impl From<crate::expr::ExprError> for Error {
    fn from(value: crate::expr::ExprError) -> Self {
        Error::Expr(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
