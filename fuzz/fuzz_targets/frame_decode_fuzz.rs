//! Fuzz test for the inbound websocket frame decoder
//!
//! Feeds arbitrary text to the decoder looking for panics on malformed or
//! hostile backend messages.
//!
//! Run with: cargo +nightly fuzz run frame_decode_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use templink_client::protocol::{decode_frames, IncomingFrame};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Decoding must return Ok or Err, never panic.
        if let Ok(frames) = decode_frames(input) {
            for frame in frames {
                if let IncomingFrame::Event { event, .. } = frame {
                    let _ = event.outcome();
                }
            }
        }
    }
});
