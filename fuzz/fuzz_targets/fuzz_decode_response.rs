#![no_main]
use evtelemetry::obd::{PidDescriptor, PidType, decode, reassemble_cells};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Interpret the input as adapter text; invalid UTF-8 is replaced lossily
    let text = String::from_utf8_lossy(data);

    // Exercise every built-in rule plus both formula notations
    let mut pids: Vec<PidDescriptor> = [
        PidType::Speed,
        PidType::StateOfCharge,
        PidType::BatteryVoltage,
        PidType::Odometer,
        PidType::CumulativeCharge,
        PidType::CumulativeDischarge,
        PidType::CellVoltages,
        PidType::CellTemperatures,
        PidType::Custom,
    ]
    .into_iter()
    .map(|t| PidDescriptor::new("fuzz", "220101", t))
    .collect();
    pids.push(PidDescriptor::new("fuzz_a", "010D", PidType::Custom).with_formula("(A*256+B)/4"));
    pids.push(
        PidDescriptor::new("fuzz_b", "220101", PidType::Custom).with_formula("[B4:B7]>>2-B1"),
    );

    for pid in &pids {
        let v = decode(&text, pid);
        assert!(v.is_nan() || v.is_finite());
    }
    let _ = reassemble_cells(&text, PidType::CellVoltages);
    let _ = reassemble_cells(&text, PidType::CellTemperatures);
});
