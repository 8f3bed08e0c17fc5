//! Device and host API enumeration.

use std::sync::Arc;

use tracing::{debug, instrument};

use audioio_host::AudioHost;
use audioio_types::{DeviceInfo, HostApiList};

use crate::AudioIoResult;

/// Enumerate every device the host exposes. Queries the platform on each call.
#[instrument(name = "list_devices", skip(host))]
pub fn list_devices(host: &dyn AudioHost) -> AudioIoResult<Vec<DeviceInfo>> {
    let devices = host.devices()?;
    debug!(count = devices.len(), "Enumerated audio devices");
    Ok(devices)
}

/// Enumerate host APIs and the default one.
#[instrument(name = "list_host_apis", skip(host))]
pub fn list_host_apis(host: &dyn AudioHost) -> AudioIoResult<HostApiList> {
    let apis = host.host_apis()?;
    debug!(
        count = apis.host_apis.len(),
        default = apis.default_host_api,
        "Enumerated host APIs"
    );
    Ok(apis)
}

/// The platform's real audio devices.
#[cfg(feature = "cpal")]
pub fn default_host() -> Arc<dyn AudioHost> {
    Arc::new(audioio_host::CpalHost::new())
}

/// A synthetic host with no hardware behind it.
pub fn loopback_host() -> Arc<dyn AudioHost> {
    Arc::new(audioio_host::LoopbackHost::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AudioIoError;
    use audioio_host::LoopbackHost;
    use audioio_types::HostApiType;

    #[test]
    fn test_list_devices() {
        let devices = list_devices(loopback_host().as_ref()).unwrap();

        assert_eq!(devices.len(), 3);
        for (index, device) in devices.iter().enumerate() {
            assert_eq!(device.id, index as u32);
            assert_eq!(device.host_api_name, "Loopback");
        }
    }

    #[test]
    fn test_list_host_apis() {
        let apis = list_host_apis(loopback_host().as_ref()).unwrap();

        assert_eq!(apis.default_host_api, 0);
        let api = &apis.host_apis[0];
        assert_eq!(api.host_type, HostApiType::InDevelopment);
        assert!(api.default_input >= 0 && (api.default_input as u32) < api.device_count);
        assert!(api.default_output >= 0 && (api.default_output as u32) < api.device_count);
    }

    #[test]
    fn test_unavailable_host() {
        let host = LoopbackHost::new();
        host.set_available(false);

        assert!(matches!(
            list_devices(&host),
            Err(AudioIoError::EngineUnavailable(_))
        ));
        assert!(matches!(
            list_host_apis(&host),
            Err(AudioIoError::EngineUnavailable(_))
        ));
    }
}
