// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Linux TAP backend.
//!
//! Attaches to an existing, pre-provisioned TAP interface through `/dev/net/tun`
//! and the `TUNSETIFF` ioctl. A reader thread forwards host frames into a channel
//! so `poll_receive` never blocks the pump.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver};

use super::NetworkBackend;
use crate::{HarnessError, HarnessResult};

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

const MAX_FRAME: usize = 65536;
const POLL_INTERVAL_MS: libc::c_int = 100;

#[repr(C)]
struct Ifreq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// Fail unless `name` is a provisioned host interface.
pub fn require_interface(name: &str) -> HarnessResult<()> {
    if Path::new("/sys/class/net").join(name).exists() {
        Ok(())
    } else {
        Err(HarnessError::MissingInterface(name.to_string()))
    }
}

pub struct TapBackend {
    fd: Arc<OwnedFd>,
    name: String,
    rx: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl TapBackend {
    pub fn open(name: &str) -> HarnessResult<Self> {
        require_interface(name)?;

        let raw = unsafe {
            libc::open(
                b"/dev/net/tun\0".as_ptr().cast::<libc::c_char>(),
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if raw < 0 {
            return Err(HarnessError::Tap(format!(
                "failed to open /dev/net/tun: {}",
                io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr = Ifreq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _padding: [0; 22],
        };
        let len = name.len().min(libc::IFNAMSIZ - 1);
        for (i, &b) in name.as_bytes()[..len].iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(HarnessError::Tap(format!(
                "TUNSETIFF on {} failed: {}",
                name,
                io::Error::last_os_error()
            )));
        }

        let fd = Arc::new(fd);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = unbounded();

        let reader = {
            let fd = fd.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("tap-rx-{}", name))
                .spawn(move || {
                    let mut buf = vec![0u8; MAX_FRAME];
                    while !stop.load(Ordering::Relaxed) {
                        let mut pfd = libc::pollfd {
                            fd: fd.as_raw_fd(),
                            events: libc::POLLIN,
                            revents: 0,
                        };
                        let ready = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL_MS) };
                        if ready <= 0 {
                            continue;
                        }
                        let n = unsafe {
                            libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                        };
                        if n <= 0 {
                            continue;
                        }
                        if tx.send(buf[..n as usize].to_vec()).is_err() {
                            break;
                        }
                    }
                })?
        };

        tracing::info!("Attached to TAP device: {}", name);

        Ok(Self {
            fd,
            name: name.to_string(),
            rx,
            stop,
            reader: Some(reader),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl NetworkBackend for TapBackend {
    fn transmit(&mut self, frame: Vec<u8>) {
        let n = unsafe { libc::write(self.fd.as_raw_fd(), frame.as_ptr().cast(), frame.len()) };
        if n < 0 {
            tracing::warn!(
                "TAP write on {} failed: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }

    fn poll_receive(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

impl Drop for TapBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_interface_is_reported() {
        let err = require_interface("bc-no-such-if0").unwrap_err();
        assert!(matches!(err, HarnessError::MissingInterface(ref n) if n == "bc-no-such-if0"));
        assert!(TapBackend::open("bc-no-such-if0").is_err());
    }
}
