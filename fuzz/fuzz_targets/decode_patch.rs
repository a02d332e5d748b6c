#![no_main]

use libfuzzer_sys::fuzz_target;
use rerun_patch::{decode, encode, replay, PatchBody};

fuzz_target!(|data: &[u8]| {
    let data = if data.len() > 64 * 1024 {
        &data[..64 * 1024]
    } else {
        data
    };

    let Ok(body) = decode(data) else {
        return;
    };
    if let PatchBody::Deltas(patch) = &body {
        let again = decode(encode(patch).as_bytes()).expect("re-decode encoded patch");
        assert_eq!(again, body);
    }

    let baseline: Vec<String> = (0..16).map(|i| format!("line {i}")).collect();
    let _ = replay(&baseline, &body);
});
