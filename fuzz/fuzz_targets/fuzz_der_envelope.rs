#![no_main]
use libfuzzer_sys::fuzz_target;

use ferric_tls::{CryptoProvider, DerCheckProvider};

fuzz_target!(|data: &[u8]| {
    let _ = DerCheckProvider.parse_certificate(data);
    let _ = DerCheckProvider.parse_public_key(data);
});
