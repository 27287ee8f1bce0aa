#![no_main]

use libfuzzer_sys::fuzz_target;
use snapcall::filter::NamePattern;
use snapcall::{ArgValue, CaptureConfig, NamedArgs, SensitivityFilter};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Pattern compilation and matching must not panic on any input
        let (pattern, subject) = input.split_once('\n').unwrap_or((input, input));
        let compiled = NamePattern::compile(pattern);
        let _ = compiled.matches(subject);

        let config = CaptureConfig {
            ignore_args: vec![pattern.to_string()],
            ..CaptureConfig::default()
        };
        let filter = SensitivityFilter::new(&config);
        let args: NamedArgs = [(subject, ArgValue::Str(input.to_string()))]
            .into_iter()
            .collect();
        let _ = filter.filter_named(&args);
    }
});
