//! Fuzz target for command buffer decoding.

#![no_main]

use libfuzzer_sys::fuzz_target;
use taskring_core::command::{self, COMMAND_ENTRY_SIZE};

fuzz_target!(|data: &[u8]| {
    match command::decode(data) {
        Ok(entries) => {
            assert_eq!(entries.len() * COMMAND_ENTRY_SIZE, data.len());
            assert_eq!(command::to_bytes(&entries), data);
        }
        Err(_) => assert_ne!(data.len() % COMMAND_ENTRY_SIZE, 0),
    }
});
