use candle::utils::{cuda_is_available, metal_is_available};
use candle::Device;

use crate::{Error, Result};

/// Lists the devices to replicate the models on.
///
/// Every visible CUDA ordinal is used, else the first Metal device, else the
/// CPU. `count` caps the result; on CPU it instead sets how many logical
/// replicas share the host.
pub fn devices(cpu: bool, count: Option<usize>) -> Result<Vec<Device>> {
    if count == Some(0) {
        return Err(Error::NoDevice("requested zero devices".to_string()));
    }
    let mut devices = vec![];
    if !cpu && cuda_is_available() {
        let max = count.unwrap_or(usize::MAX);
        let mut ordinal = 0;
        while devices.len() < max {
            match Device::new_cuda(ordinal) {
                Ok(device) => devices.push(device),
                Err(_) if ordinal > 0 => break,
                Err(err) => return Err(err.into()),
            }
            ordinal += 1;
        }
    } else if !cpu && metal_is_available() {
        devices.push(Device::new_metal(0)?);
    }
    if devices.is_empty() {
        if !cpu {
            tracing::warn!(
                "running on CPU, to run on GPU build with `--features cuda` or `--features metal`"
            );
        }
        devices = vec![Device::Cpu; count.unwrap_or(1)];
    }
    tracing::info!(count = devices.len(), "devices: {:?}", devices.first());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_cpu_devices() -> Result<()> {
        let cpus = devices(true, Some(4))?;
        assert_eq!(cpus.len(), 4);
        assert!(cpus.iter().all(|d| d.is_cpu()));
        let single = devices(true, None)?;
        assert_eq!(single.len(), 1);
        assert!(single[0].is_cpu());
        Ok(())
    }

    #[test]
    fn zero_devices_is_an_error() {
        assert!(matches!(devices(true, Some(0)), Err(Error::NoDevice(_))));
    }
}
