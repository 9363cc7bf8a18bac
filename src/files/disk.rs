use std::path::{Path, PathBuf};

use sysinfo::Disks;

/// Reports free space for the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    /// `None` when the space cannot be determined.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// Reads free space from the mounted disk list through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoSpaceProbe;

impl SpaceProbe for SysinfoSpaceProbe {
    fn available_space(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
    }
}

/// Mount point most specific to `path`, for health reports.
pub fn mount_point_of(path: &Path) -> Option<PathBuf> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .map(|disk| disk.mount_point().to_path_buf())
        .filter(|mount| path.starts_with(mount))
        .max_by_key(|mount| mount.components().count())
}

/// Fixed answer, for tests.
#[cfg(test)]
pub(crate) struct FixedSpace(pub Option<u64>);

#[cfg(test)]
impl SpaceProbe for FixedSpace {
    fn available_space(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_has_no_space_reading() {
        let probe = SysinfoSpaceProbe;
        assert_eq!(
            probe.available_space(Path::new("/definitely/not/a/real/path/stemsplit")),
            None
        );
    }

    #[test]
    fn fixed_probe_reports_its_value() {
        assert_eq!(FixedSpace(Some(42)).available_space(Path::new(".")), Some(42));
    }
}
