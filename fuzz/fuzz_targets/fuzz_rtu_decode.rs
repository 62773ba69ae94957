//! Arbitrary RTU frames must never panic the decoder, and anything it
//! accepts must survive a re-encode unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_acquisition::frame::{decode_rtu, encode_rtu, expected_rtu_response_len};

fuzz_target!(|data: &[u8]| {
    if data.len() >= 3 {
        let _ = expected_rtu_response_len(&[data[0], data[1], data[2]]);
    }

    if let Ok((slave, pdu)) = decode_rtu(data) {
        assert_eq!(&encode_rtu(slave, &pdu)[..], data);
    }
});
