//! Host capacity probing and usage accounting.

use crate::records::ResourceRequest;

/// Physical capacity of this host, as advertised in its presence record.
#[derive(Debug, Clone, Copy)]
pub struct SystemResources {
    pub total_ram_mib: u64,
    pub total_vcpu: u32,
}

impl SystemResources {
    /// Detect the host's total RAM and online CPU count.
    pub fn detect() -> Self {
        Self {
            total_ram_mib: total_ram_mib(),
            total_vcpu: cpu_count(),
        }
    }
}

/// Resources committed to locally running instances.
///
/// Usage is accounted from placement requests, not measured from the
/// hypervisor: a claimed placement consumes its requested shape whether or
/// not the guest actually uses it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub ram_mib: u64,
    pub vcpus: u32,
}

impl ResourceUsage {
    pub fn add(&mut self, request: &ResourceRequest) {
        self.ram_mib += request.ram_mib;
        self.vcpus += request.vcpus;
    }
}

fn cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn total_ram_mib() -> u64 {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        if let Some(total) = parse_meminfo_total_mib(&meminfo) {
            return total;
        }
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size > 0 && total_pages > 0 {
        return (page_size as u64 * total_pages as u64) / (1024 * 1024);
    }

    16 * 1024
}

#[cfg(not(target_os = "linux"))]
fn total_ram_mib() -> u64 {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if page_size > 0 && total_pages > 0 {
            return (page_size as u64 * total_pages as u64) / (1024 * 1024);
        }
    }

    16 * 1024
}

#[cfg(target_os = "linux")]
fn parse_meminfo_total_mib(content: &str) -> Option<u64> {
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("MemTotal:") {
            let kb: u64 = parts.next()?.parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}
