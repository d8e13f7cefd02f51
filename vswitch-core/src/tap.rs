//! TAP device: open/configure via the `tun` crate, split into async
//! read/write halves, and a pump task that feeds frames to the egress
//! entry point until told to stop.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::warn;
use tun::{AsyncDevice, Configuration};

use crate::config::Config;
use crate::error::{Result, SwitchError};

/// Size of the pump's read buffer, matching the source implementation's
/// TAP read buffer.
const READ_BUFFER_SIZE: usize = 1024 * 1024;

pub struct TapReader(ReadHalf<AsyncDevice>);
pub struct TapWriter(WriteHalf<AsyncDevice>);

/// Opens and configures the TAP device per `config`. Does not attempt to
/// set the interface's hardware address: the `tun` crate exposes no
/// portable way to do so, and the kernel-assigned MAC on the device is
/// irrelevant to the forwarding engine, which only ever compares
/// `config.local_mac` against frame bytes, never the kernel's notion of
/// the interface's address.
pub fn open(config: &Config) -> Result<(TapReader, TapWriter)> {
    let mut tun_config = Configuration::default();
    tun_config.name(&config.interface_name);
    tun_config.mtu(config.mtu as i32);
    if let Some(ip) = config.local_ip {
        tun_config.address(ip);
        tun_config.netmask(prefix_to_netmask(config.mask));
    }
    if config.auto_up {
        tun_config.up();
    }
    #[cfg(target_os = "linux")]
    tun_config.platform(|platform_config| {
        platform_config.packet_information(false);
    });

    let device = tun::create_as_async(&tun_config)
        .map_err(|e| SwitchError::Tap(io::Error::other(e.to_string())))?;
    let (reader, writer) = tokio::io::split(device);
    Ok((TapReader(reader), TapWriter(writer)))
}

fn prefix_to_netmask(prefix: u8) -> std::net::Ipv4Addr {
    let bits = if prefix >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix)
    };
    std::net::Ipv4Addr::from(bits)
}

impl TapWriter {
    pub async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.0.write_all(frame).await
    }
}

/// Reads frames in a loop and hands each to `on_frame`, until `stop`
/// observes `true`. A transient read error is logged and the loop
/// continues, per the source's TAP failure model.
pub async fn pump<F>(mut reader: TapReader, mut stop: watch::Receiver<bool>, mut on_frame: F)
where
    F: FnMut(Vec<u8>),
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            result = reader.0.read(&mut buf) => {
                match result {
                    Ok(0) => continue,
                    Ok(n) => on_frame(buf[..n].to_vec()),
                    Err(e) => warn!(error = %e, "tap read error, continuing"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_24_yields_standard_class_c_netmask() {
        assert_eq!(prefix_to_netmask(24), std::net::Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn prefix_0_yields_all_zero_netmask() {
        assert_eq!(prefix_to_netmask(0), std::net::Ipv4Addr::new(0, 0, 0, 0));
    }

    #[test]
    fn prefix_32_yields_host_netmask() {
        assert_eq!(prefix_to_netmask(32), std::net::Ipv4Addr::new(255, 255, 255, 255));
    }
}
