use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no pool with id {0}")]
    NoPool(u8),
    #[error("pool {0} is already attached")]
    PoolExists(u8),
    #[error("insufficient descriptors: requested {requested}, available {available}")]
    Insufficient { requested: usize, available: usize },
    #[error("descriptor id {id:#x} out of range")]
    IdOutOfRange { id: u32 },
    #[error("invalid pool configuration: {0}")]
    BadConfig(&'static str),
    #[error("failed to allocate {requested} backing pages")]
    NoMemoryPages { requested: usize },
    #[error("pool {0} still has outstanding descriptors")]
    Busy(u8),
}
