use crate::config::SessionConfig;
use crate::types::RecordingMeasurement;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RecordingReport {
    pub measurement: Option<RecordingMeasurement>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl RecordingReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}

/// Structural checks on a recorded segment: present, big enough, a readable WAV,
/// and close to the expected length. A different sample rate only warns.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingValidator {
    pub min_size_bytes: u64,
    pub expected_seconds: f64,
    pub tolerance_seconds: f64,
    pub expected_sample_rate: u32,
}

impl RecordingValidator {
    pub fn from_session(session: &SessionConfig) -> Self {
        Self {
            min_size_bytes: session.min_recording_bytes,
            expected_seconds: session.segment_seconds,
            tolerance_seconds: session.duration_tolerance_seconds,
            expected_sample_rate: session.expected_sample_rate,
        }
    }

    pub fn validate(&self, path: &Path) -> RecordingReport {
        let mut report = RecordingReport::default();

        let size_bytes = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                report.errors.push(format!("{} is not a file", path.display()));
                return report;
            }
            Err(_) => {
                report
                    .errors
                    .push(format!("{} does not exist", path.display()));
                return report;
            }
        };
        if size_bytes < self.min_size_bytes {
            report.errors.push(format!(
                "file too small: {size_bytes} bytes (minimum {})",
                self.min_size_bytes
            ));
            return report;
        }

        let mut reader = match hound::WavReader::open(path) {
            Ok(reader) => reader,
            Err(err) => {
                report.errors.push(format!("unreadable WAV: {err}"));
                return report;
            }
        };
        let spec = reader.spec();
        if spec.sample_rate == 0 || spec.channels == 0 {
            report
                .errors
                .push("WAV header declares no samples per second or no channels".to_string());
            return report;
        }
        // The header length survives truncation on disk; only samples that read back count.
        let declared_samples = reader.len();
        let readable_samples = readable_samples(&mut reader);
        if readable_samples < declared_samples {
            report.errors.push(format!(
                "truncated: {readable_samples} of {declared_samples} declared samples readable"
            ));
        }
        let frames = readable_samples / u32::from(spec.channels);
        let duration_seconds = f64::from(frames) / f64::from(spec.sample_rate);
        report.measurement = Some(RecordingMeasurement {
            size_bytes,
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        });

        if (duration_seconds - self.expected_seconds).abs() > self.tolerance_seconds {
            report.errors.push(format!(
                "duration {duration_seconds:.2}s outside {:.2}s ± {:.2}s",
                self.expected_seconds, self.tolerance_seconds
            ));
        }
        if spec.sample_rate != self.expected_sample_rate {
            report.warnings.push(format!(
                "sample rate {} Hz differs from expected {} Hz",
                spec.sample_rate, self.expected_sample_rate
            ));
        }
        report
    }
}

fn readable_samples<R: std::io::Read>(reader: &mut hound::WavReader<R>) -> u32 {
    let count = match reader.spec().sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().take_while(Result::is_ok).count(),
        hound::SampleFormat::Int => reader.samples::<i32>().take_while(Result::is_ok).count(),
    };
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, seconds: f64, sample_rate: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create");
        for _ in 0..(seconds * f64::from(sample_rate)) as u64 {
            writer.write_sample(0i16).expect("sample");
        }
        writer.finalize().expect("finalize");
    }

    fn validator() -> RecordingValidator {
        RecordingValidator {
            min_size_bytes: 1024,
            expected_seconds: 1.0,
            tolerance_seconds: 0.2,
            expected_sample_rate: 8000,
        }
    }

    #[test]
    fn well_formed_recording_passes_with_measurement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip_noise.wav");
        write_wav(&path, 1.1, 8000);

        let report = validator().validate(&path);
        assert!(report.is_valid(), "{:?}", report.errors);
        let measurement = report.measurement.expect("measurement");
        assert!((measurement.duration_seconds - 1.1).abs() < 1e-6);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_small_and_garbage_files_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = validator().validate(&dir.path().join("absent.wav"));
        assert!(missing.error_summary().contains("does not exist"));

        let small = dir.path().join("small.wav");
        std::fs::write(&small, vec![0u8; 100]).expect("write");
        assert!(validator().validate(&small).error_summary().contains("too small"));

        let garbage = dir.path().join("garbage.wav");
        std::fs::write(&garbage, vec![7u8; 4096]).expect("write");
        assert!(validator()
            .validate(&garbage)
            .error_summary()
            .contains("unreadable WAV"));
    }

    #[test]
    fn duration_outside_tolerance_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.wav");
        write_wav(&path, 0.5, 8000);
        let report = validator().validate(&path);
        assert!(!report.is_valid());
        assert!(report.error_summary().contains("outside"));
    }

    #[test]
    fn recording_cut_short_on_disk_fails_despite_intact_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip_warp.wav");
        write_wav(&path, 1.0, 8000);
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_len(2000))
            .expect("truncate");

        let report = validator().validate(&path);
        assert!(!report.is_valid());
        assert!(report.error_summary().contains("truncated"), "{:?}", report.errors);
        let measurement = report.measurement.expect("measurement");
        assert_eq!(measurement.size_bytes, 2000);
        assert!(measurement.duration_seconds < 0.2);
    }

    #[test]
    fn sample_rate_mismatch_only_warns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rate.wav");
        write_wav(&path, 1.0, 16_000);
        let report = validator().validate(&path);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }
}
