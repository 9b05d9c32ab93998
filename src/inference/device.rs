use anyhow::{anyhow, Result};
use candle::Device;
use tracing::warn;

/// Resolves a `SUMMARIZER_DEVICE` preference. `None` picks CUDA:0 when the
/// binary was built with CUDA support and a device is present, else the CPU.
pub fn build_device(preference: Option<&str>) -> Result<Device> {
    let Some(pref) = preference.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(Device::cuda_if_available(0)?);
    };

    let lower = pref.to_ascii_lowercase();
    match lower.split_once(':').map_or(lower.as_str(), |(kind, _)| kind) {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => {
            let ordinal = cuda_ordinal(&lower);
            Device::new_cuda(ordinal).map_err(|err| {
                anyhow!(
                    "requested CUDA device {ordinal} but initialization failed ({err}). Build \
                     with the `cuda` feature and ensure CUDA libraries are available."
                )
            })
        }
        _ => {
            warn!("unrecognized SUMMARIZER_DEVICE value '{pref}', defaulting to auto");
            Ok(Device::cuda_if_available(0)?)
        }
    }
}

/// `cuda:N` / `gpu:N` → N; a bare or malformed suffix means device 0.
fn cuda_ordinal(pref: &str) -> usize {
    pref.split_once(':')
        .and_then(|(_, n)| n.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_preference_is_case_insensitive() {
        assert!(matches!(build_device(Some("CPU")).unwrap(), Device::Cpu));
        assert!(matches!(build_device(Some(" cpu ")).unwrap(), Device::Cpu));
    }

    #[test]
    fn unknown_preference_falls_back_to_auto() {
        assert!(build_device(Some("tpu")).is_ok());
        assert!(build_device(None).is_ok());
        assert!(build_device(Some("")).is_ok());
    }

    #[test]
    fn cuda_ordinal_defaults_to_zero() {
        assert_eq!(cuda_ordinal("cuda:3"), 3);
        assert_eq!(cuda_ordinal("gpu:1"), 1);
        assert_eq!(cuda_ordinal("cuda"), 0);
        assert_eq!(cuda_ordinal("cuda:x"), 0);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_request_without_backend_fails() {
        let err = build_device(Some("cuda:1")).unwrap_err();
        assert!(err.to_string().contains("CUDA device 1"));
    }
}
