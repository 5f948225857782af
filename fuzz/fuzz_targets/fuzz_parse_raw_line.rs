#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for schema in sensorlog::schema::ALL_SCHEMAS {
        if let Ok(record) = sensorlog::protocol::parse_raw_line(data, schema.arity()) {
            assert_eq!(record.fields().count(), schema.arity());
        }
    }
});
