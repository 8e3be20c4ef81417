//! Identity types for subscribers and backend subscriptions

use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_id!(
    /// One registered consumer callback. Allocated by the cache, never reused.
    SubscriberId,
    "sub"
);

define_id!(
    /// Stable tag of a cache entry on the push channel.
    ///
    /// Pushes from the backend carry this id; the registry routes it back to
    /// the owning entry. It outlives reconnects, unlike [`BackendHandle`].
    CorrelationId,
    "corr"
);

define_id!(
    /// Opaque reference to one live backend subscription, as returned by the
    /// backend when it acknowledges a subscribe request.
    BackendHandle,
    "backend"
);
