//! Encoding of values written through the cache helper.

use serde::Serialize;

/// A value that can be written to the cache store.
///
/// Strings and byte slices are stored as-is, numbers and booleans in their
/// textual form, and anything wrapped in [`Json`] as serialized JSON.
pub trait CacheValue {
    /// Encode the value into the bytes sent to the store.
    ///
    /// # Errors
    /// Returns the serializer error for values that cannot be represented as JSON.
    fn encode(&self) -> serde_json::Result<Vec<u8>>;
}

impl<T: CacheValue + ?Sized> CacheValue for &T {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        (**self).encode()
    }
}

impl CacheValue for str {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }
}

impl CacheValue for String {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        self.as_str().encode()
    }
}

impl CacheValue for [u8] {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        Ok(self.to_vec())
    }
}

impl CacheValue for Vec<u8> {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        Ok(self.clone())
    }
}

macro_rules! impl_cache_value_as_json {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CacheValue for $ty {
                fn encode(&self) -> serde_json::Result<Vec<u8>> {
                    serde_json::to_vec(self)
                }
            }
        )*
    };
}

impl_cache_value_as_json!(bool, i32, i64, u32, u64, f64);

/// Wrapper that stores any serializable value as JSON.
///
/// ```rust,ignore
/// helper.set(&ctx, "user:1", &Json(&user), Duration::from_secs(60)).await?;
/// let user: Option<User> = helper.get_object(&ctx, "user:1").await?;
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: Serialize> CacheValue for Json<T> {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.0)
    }
}
