//! Best effort description of the host a benchmark runs on
use crate::database::SystemConfig;
use itertools::Itertools;
use std::{fs, io};
use sysinfo::{Disks, System};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const APP_NAME: &str = "pgmark";

const MACHINE_ID_FILES: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

#[derive(Error, Debug)]
pub enum SystemError {
    #[error("failed to determine a machine id: {0}")]
    MachineId(#[source] io::Error),
    #[error("no {0} information available")]
    Unavailable(&'static str),
}

/// Hash a raw machine id together with the application name, the raw id never leaves the host
pub fn hash_machine_id(raw: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{APP_NAME}:{raw}").as_bytes()).to_string()
}

fn raw_machine_id() -> Result<String, SystemError> {
    for path in MACHINE_ID_FILES {
        match fs::read_to_string(path) {
            Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_owned()),
            Ok(_) => debug!(path = path, "Machine id file is empty"),
            Err(error) => debug!(path = path, error = ?error, "Failed to read machine id file"),
        }
    }

    // hosts without a machine id still get a stable identity
    nix::unistd::gethostname()
        .map_err(|errno| SystemError::MachineId(io::Error::from(errno)))
        .map(|hostname| hostname.to_string_lossy().into_owned())
}

/// Number of distinct physical packages listed in a `/proc/cpuinfo` dump
fn count_packages(cpuinfo: &str) -> Option<u32> {
    let packages = cpuinfo
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(key, _)| key.trim() == "physical id")
        .map(|(_, value)| value.trim())
        .unique()
        .count();

    u32::try_from(packages).ok().filter(|packages| *packages > 0)
}

/// Collect the host description, failures are returned next to the partial result
pub fn detect() -> (SystemConfig, Vec<SystemError>) {
    let mut errors = Vec::new();
    let mut config = SystemConfig {
        os_name: Some(std::env::consts::OS.to_owned()),
        os_arch: Some(std::env::consts::ARCH.to_owned()),
        ..Default::default()
    };

    match raw_machine_id() {
        Ok(raw) => config.machine_id = Some(hash_machine_id(&raw)),
        Err(error) => errors.push(error),
    }

    let mut system = System::new_all();
    system.refresh_memory();

    match system.cpus().first() {
        Some(cpu) => {
            config.cpu_vendor = Some(cpu.vendor_id().to_owned()).filter(|v| !v.is_empty());
            config.cpu_model = Some(cpu.brand().trim().to_owned()).filter(|m| !m.is_empty());
            config.cpu_threads = u32::try_from(system.cpus().len()).ok();
            config.cpu_cores = system
                .physical_core_count()
                .and_then(|cores| u32::try_from(cores).ok());
            config.cpu_count = fs::read_to_string("/proc/cpuinfo")
                .ok()
                .and_then(|cpuinfo| count_packages(&cpuinfo))
                .or(Some(1));
        }
        None => errors.push(SystemError::Unavailable("cpu")),
    }

    match system.total_memory() {
        0 => errors.push(SystemError::Unavailable("memory")),
        total => {
            config.ram_physical = Some(total);
            config.ram_usable = Some(system.available_memory()).filter(|usable| *usable > 0);
        }
    }

    let disks = Disks::new_with_refreshed_list();
    // one device can be mounted more than once
    let devices = disks
        .iter()
        .unique_by(|disk| disk.name().to_os_string())
        .collect_vec();
    if devices.is_empty() {
        errors.push(SystemError::Unavailable("disk"));
    } else {
        config.disk_count = u32::try_from(devices.len()).ok();
        config.disk_space_total = Some(devices.iter().map(|disk| disk.total_space()).sum())
            .filter(|total| *total > 0);
    }

    for error in &errors {
        warn!(error = %error, "Incomplete system information");
    }

    (config, errors)
}

#[cfg(test)]
mod tests {
    use super::{count_packages, detect, hash_machine_id};

    #[test]
    fn machine_id_is_hashed_deterministically() {
        let hashed = hash_machine_id("4c4c4544-0042");

        assert_eq!(hashed, hash_machine_id("4c4c4544-0042"));
        assert_ne!(hashed, hash_machine_id("4c4c4544-0043"));
        assert!(!hashed.contains("4c4c4544-0042"));
        assert_eq!(hashed.len(), 36);
    }

    #[test]
    fn counts_distinct_packages() {
        let cpuinfo = "processor\t: 0\nphysical id\t: 0\n\nprocessor\t: 1\nphysical id\t: 0\n\n\
                       processor\t: 2\nphysical id\t: 1\n";

        assert_eq!(count_packages(cpuinfo), Some(2));
        assert_eq!(count_packages("processor\t: 0\n"), None);
    }

    #[test]
    fn detection_never_fails_hard() {
        let (config, _errors) = detect();

        assert_eq!(config.os_name.as_deref(), Some(std::env::consts::OS));
        assert!(config.cpu_threads.map_or(true, |threads| threads > 0));
        assert!(config.machine_id.map_or(true, |id| !id.is_empty()));
    }
}
