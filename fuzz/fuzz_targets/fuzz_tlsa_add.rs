#![no_main]
use libfuzzer_sys::fuzz_target;

use ferric_tls::dane::{DaneStore, DaneTable};
use ferric_tls::DerCheckProvider;

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }
    let mut table = DaneTable::default();
    table.enable();
    let mut store = DaneStore::new(0);
    let _ = store.add_record(
        &table,
        &DerCheckProvider,
        data[0],
        data[1],
        data[2],
        &data[3..],
    );
});
