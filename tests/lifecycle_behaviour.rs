//! Behavioural scenarios for the operation lifecycle and the cleaner.

mod lifecycle;
