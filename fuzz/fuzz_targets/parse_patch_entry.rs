#![no_main]

use libfuzzer_sys::fuzz_target;
use rerun_archive::parse_patch_entry_name;

fuzz_target!(|data: &[u8]| {
    let data = if data.len() > 4 * 1024 {
        &data[..4 * 1024]
    } else {
        data
    };

    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };
    if let Some((key, run)) = parse_patch_entry_name(name) {
        let canonical = format!("patches/{key}_{run}");
        assert_eq!(parse_patch_entry_name(&canonical), Some((key, run)));
    }
});
