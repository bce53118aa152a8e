//! Task trait - binds a runner name to a payload type.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A payload type with a fixed runner name.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Task for SendEmail {
///     const NAME: &'static str = "email";
/// }
/// ```
///
/// The payload is stored as the job's `data`, so it must round-trip through
/// JSON.
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}
