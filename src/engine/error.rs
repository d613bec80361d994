use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The requested interval overlaps a live booking on the slot.
    SlotUnavailable { slot: Ulid, conflicting: Ulid },
    /// Every slot of the lot is occupied or out of service for the interval.
    NoSlotsAvailable(Ulid),
    LotClosed(Ulid),
    WrongLot { slot: Ulid, lot: Ulid },
    DuplicateSlotNumber(String),
    /// Operation not valid for the booking's current status.
    InvalidState(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotUnavailable { slot, conflicting } => {
                write!(f, "slot {slot} unavailable: conflicts with booking {conflicting}")
            }
            EngineError::NoSlotsAvailable(lot) => {
                write!(f, "no slots available in lot {lot} for the requested interval")
            }
            EngineError::LotClosed(lot) => write!(f, "lot {lot} is closed"),
            EngineError::WrongLot { slot, lot } => {
                write!(f, "slot {slot} does not belong to lot {lot}")
            }
            EngineError::DuplicateSlotNumber(n) => {
                write!(f, "slot number {n:?} already taken in this lot")
            }
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
