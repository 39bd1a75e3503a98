// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Logging macros for the chip drivers.
//!
//! With the `defmt` feature the macros forward to `defmt`. Without it they
//! expand to a branch that is never taken, so arguments are still
//! type-checked but nothing is emitted. Format strings must stick to `{}` and
//! `{:?}`, which both paths accept.

#[cfg(feature = "defmt")]
macro_rules! __log {
    ($level:ident, $($arg:tt)*) => {
        ::defmt::$level!($($arg)*)
    };
}

#[cfg(not(feature = "defmt"))]
macro_rules! __log {
    ($level:ident, $($arg:tt)*) => {{
        if false {
            let _ = ::core::format_args!($($arg)*);
        }
    }};
}

macro_rules! trace {
    ($($arg:tt)*) => { $crate::log::__log!(trace, $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { $crate::log::__log!(debug, $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { $crate::log::__log!(info, $($arg)*) };
}

macro_rules! warning {
    ($($arg:tt)*) => { $crate::log::__log!(warn, $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { $crate::log::__log!(error, $($arg)*) };
}

pub(crate) use {__log, debug, error, info, trace, warning};

#[cfg(test)]
mod test {
    use super::{debug, error, info, trace, warning};

    #[derive(Debug)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    struct Level(u8);

    #[test]
    fn every_level_expands() {
        let level = Level(3);
        trace!("trace {}", 1);
        debug!("debug {:?}", level);
        info!("info");
        warning!("warning {} {:?}", 2, level);
        error!("error {}", level.0);
    }
}
