//! Logging macros that forward to `defmt` and/or `log`, depending on which
//! features are enabled. With neither feature active they compile to nothing.

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        defmt::trace!($($args)*);
        #[cfg(feature = "log")]
        log::trace!($($args)*);
    }
}

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        defmt::debug!($($args)*);
        #[cfg(feature = "log")]
        log::debug!($($args)*);
    }
}

macro_rules! info {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        defmt::info!($($args)*);
        #[cfg(feature = "log")]
        log::info!($($args)*);
    }
}

macro_rules! warn_ {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        defmt::warn!($($args)*);
        #[cfg(feature = "log")]
        log::warn!($($args)*);
    }
}

macro_rules! error {
    ($($args:tt)*) => {
        #[cfg(feature = "defmt")]
        defmt::error!($($args)*);
        #[cfg(feature = "log")]
        log::error!($($args)*);
    }
}

#[allow(unused_imports)]
pub(crate) use {debug, error, info, trace, warn_ as warn};
