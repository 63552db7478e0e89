//! Registration of the Hyper-V guest communication service.
//!
//! Hyper-V only forwards guest sockets for services listed under
//! `GuestCommunicationServices`; the entry takes effect after a reboot.

use keyrelay_transport::hyperv::service_guid;

pub const SERVICES_KEY: &str =
    r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Virtualization\GuestCommunicationServices";

/// Registry key (under `HKEY_LOCAL_MACHINE`) describing the service.
pub fn service_key(port: u32) -> String {
    format!(r"{SERVICES_KEY}\{}", service_guid(port))
}

#[cfg(windows)]
pub fn install_hyperv_service(port: u32) -> anyhow::Result<()> {
    use windows_sys::Win32::Foundation::ERROR_SUCCESS;
    use windows_sys::Win32::System::Registry::{
        HKEY, HKEY_LOCAL_MACHINE, KEY_ALL_ACCESS, REG_OPTION_NON_VOLATILE, REG_SZ, RegCloseKey,
        RegCreateKeyExW, RegSetValueExW,
    };

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    let path = wide(&service_key(port));
    let name = wide("ElementName");
    let value = wide("keyrelay");

    let mut key: HKEY = std::ptr::null_mut();
    // SAFETY: all strings are NUL-terminated and outlive the calls; `key`
    // is closed before returning.
    unsafe {
        let status = RegCreateKeyExW(
            HKEY_LOCAL_MACHINE,
            path.as_ptr(),
            0,
            std::ptr::null(),
            REG_OPTION_NON_VOLATILE,
            KEY_ALL_ACCESS,
            std::ptr::null(),
            &mut key,
            std::ptr::null_mut(),
        );
        if status != ERROR_SUCCESS {
            anyhow::bail!(
                "cannot create service key (run as administrator): {}",
                std::io::Error::from_raw_os_error(status as i32)
            );
        }
        let status = RegSetValueExW(
            key,
            name.as_ptr(),
            0,
            REG_SZ,
            value.as_ptr().cast(),
            (value.len() * 2) as u32,
        );
        RegCloseKey(key);
        if status != ERROR_SUCCESS {
            anyhow::bail!(
                "cannot set ElementName: {}",
                std::io::Error::from_raw_os_error(status as i32)
            );
        }
    }
    tracing::info!(key = %service_key(port), "hyper-v service registered");
    Ok(())
}

#[cfg(not(windows))]
pub fn install_hyperv_service(_port: u32) -> anyhow::Result<()> {
    anyhow::bail!("Hyper-V service registration requires Windows")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_names_the_guid() {
        assert_eq!(
            service_key(0x2222_3333),
            r"SOFTWARE\Microsoft\Windows NT\CurrentVersion\Virtualization\GuestCommunicationServices\22223333-facb-11e6-bd58-64006a7986d3"
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn install_requires_windows() {
        assert!(install_hyperv_service(0x2222_3333).is_err());
    }
}
