pub mod stores;

/// Fixed starting time for manual clocks (2023-11-14T22:13:20Z).
pub const T0: u64 = 1_700_000_000_000;
