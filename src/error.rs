//! Error types for the fleet control plane.
//!
//! Each layer owns one enum. Protocol and device errors never cross the
//! transport boundary as failures: protocol errors are logged and the message
//! dropped, device errors are rendered into a failed [`CommandResponse`].
//!
//! [`CommandResponse`]: crate::messages::CommandResponse

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Malformed topic or payload. Logged and dropped, never retried.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Topic does not follow `Parking/{parkingId}/{kind}/{vehicleId}`.
    #[error("malformed topic '{0}'")]
    MalformedTopic(String),

    /// Third topic level is not a known message kind.
    #[error("unknown topic kind '{0}'")]
    UnknownKind(String),

    /// A topic level that must be numeric is not.
    #[error("invalid {field} '{value}' in topic")]
    InvalidId {
        /// Which level failed (`parking id` or `vehicle id`).
        field: &'static str,
        /// The raw level text.
        value: String,
    },

    /// Payload is not a valid JSON envelope for the topic kind.
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Reasons a device refuses a command. Rendered into `errorDescription`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// No emulator registered for the addressed vehicle.
    #[error("vehicle {0} not found in emulation")]
    NotFound(i64),

    /// The command is valid but the current state forbids it.
    #[error("{0}")]
    InvalidTransition(String),

    /// A required parameter is missing or not understood.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Publish/subscribe failure reported by a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Failed to connect to the broker.
    #[error("MQTT connect error: {0}")]
    Connect(String),
    /// Failed to subscribe to a topic filter.
    #[error("MQTT subscribe error: {0}")]
    Subscribe(String),
    /// Failed to remove a subscription.
    #[error("MQTT unsubscribe error: {0}")]
    Unsubscribe(String),
    /// Failed to publish a message.
    #[error("MQTT publish error: {0}")]
    Publish(String),
}

/// Command publishing failed after every retry.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// All attempts failed; carries the last transport error.
    #[error("command {command_id} not delivered after {attempts} attempts: {source}")]
    Exhausted {
        /// Id of the command that could not be published.
        command_id: Uuid,
        /// Number of attempts made.
        attempts: u32,
        /// Last transport failure.
        #[source]
        source: TransportError,
    },

    /// The command could not be encoded.
    #[error("command encoding failed: {0}")]
    Encode(#[from] ProtocolError),

    /// No correlated response arrived in time.
    #[error("no response to command {0} before timeout")]
    Timeout(Uuid),
}

/// Data-access failure reported by a [`FleetStore`](crate::traits::FleetStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A row addressed by a mutation does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Backend failure (connection, serialization, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result alias for data-access calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the ride lifecycle engine.
#[derive(Debug, Error)]
pub enum RideError {
    /// No account for the user.
    #[error("account {0} not found")]
    AccountNotFound(i64),

    /// The account is suspended.
    #[error("account {0} is suspended")]
    AccountSuspended(i64),

    /// Balance is below the base fare.
    #[error("insufficient balance: {available} available, {required} required")]
    InsufficientBalance {
        /// Minimum balance to start a ride.
        required: Decimal,
        /// Current balance.
        available: Decimal,
    },

    /// The user already has an open ride.
    #[error("user {0} already has an active ride")]
    RideInProgress(i64),

    /// No vehicle with the given matricola.
    #[error("vehicle {0} not found")]
    VehicleNotFound(String),

    /// The vehicle is (no longer) available for rental.
    #[error("vehicle {0} is no longer available")]
    VehicleUnavailable(String),

    /// No ride with the given id.
    #[error("ride {0} not found")]
    RideNotFound(i64),

    /// The ride was already closed by another path.
    #[error("ride {0} is already terminated")]
    AlreadyTerminated(i64),

    /// The ride belongs to someone else.
    #[error("ride {ride_id} does not belong to user {user_id}")]
    NotRideOwner {
        /// Ride addressed.
        ride_id: i64,
        /// Caller.
        user_id: i64,
    },

    /// The dropoff parking is unknown or inactive.
    #[error("parking {0} is not an active parking")]
    InvalidParking(i64),

    /// Top-up amount must be positive.
    #[error("invalid amount {0}")]
    InvalidAmount(Decimal),

    /// Data-access failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RideError {
    /// Whether this is a lost race against a concurrent mutation.
    ///
    /// Callers report these as user-facing conditions, not failures.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            RideError::VehicleUnavailable(_) | RideError::AlreadyTerminated(_)
        )
    }
}

/// Errors surfaced by the gateway fleet manager and parking service.
#[derive(Debug, Error)]
pub enum FleetError {
    /// No parking with the given id.
    #[error("parking {0} not found")]
    ParkingNotFound(i64),

    /// No vehicle with the given matricola.
    #[error("vehicle {0} not found")]
    VehicleNotFound(String),

    /// Data-access failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Subscribe/unsubscribe failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
