//! Feed arbitrary bytes through the TCP response path: MBAP header, PDU,
//! then the read/write response parsers with an arbitrary expectation.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_acquisition::frame::MbapHeader;
use voltage_acquisition::pdu::ModbusPdu;

#[derive(Debug, Arbitrary)]
struct Input {
    head: [u8; 7],
    body: Vec<u8>,
    function_code: u8,
    address: u16,
    quantity: u16,
}

fuzz_target!(|input: Input| {
    let Ok(header) = MbapHeader::parse(&input.head) else {
        return;
    };
    let len = header.pdu_len().min(input.body.len());
    let Ok(pdu) = ModbusPdu::from_slice(&input.body[..len]) else {
        return;
    };

    if let Ok(words) = pdu.parse_read_response(input.function_code, input.quantity) {
        assert_eq!(words.len(), input.quantity as usize);
    }
    let _ = pdu.parse_write_response(input.function_code, input.address, input.quantity);
    let _ = pdu.exception_code();
});
