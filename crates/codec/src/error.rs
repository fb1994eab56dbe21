use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("no parsing strategy produced a plausible value")]
    NoPlausibleValue,

    #[error("characteristic {0} has no decoder")]
    UnroutableCharacteristic(Uuid),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
