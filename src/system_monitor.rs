use metrics::gauge;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::time;

const LOW_DISK_FRACTION: f64 = 0.1;

/// Periodically publishes memory, CPU and the free space of the disk holding `data_path`.
/// Programs and results share that disk, so running low is logged.
pub async fn start_system_monitor(data_path: PathBuf) {
    let data_path = std::fs::canonicalize(&data_path).unwrap_or(data_path);

    tokio::spawn(async move {
        let mut system = System::new_all();
        let mut disks = Disks::new_with_refreshed_list();
        let mut interval = time::interval(Duration::from_secs(5));
        let mut warned = false;

        loop {
            interval.tick().await;

            system.refresh_memory();
            system.refresh_cpu_all();
            disks.refresh(true);

            gauge!("system_memory_used_bytes").set(system.used_memory() as f64);
            gauge!("system_memory_total_bytes").set(system.total_memory() as f64);
            gauge!("system_cpu_usage_percent").set(system.global_cpu_usage() as f64);

            let Some((free, total)) = data_disk_space(&disks, &data_path) else {
                continue;
            };
            gauge!("system_disk_free_bytes").set(free as f64);
            gauge!("system_disk_total_bytes").set(total as f64);

            let low = total > 0 && (free as f64) < (total as f64) * LOW_DISK_FRACTION;
            if low && !warned {
                tracing::warn!("data disk is low on space: {} of {} bytes free", free, total);
            }
            warned = low;
        }
    });
}

/// `(available, total)` of the disk with the longest mount point containing `path`.
fn data_disk_space(disks: &Disks, path: &Path) -> Option<(u64, u64)> {
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| (disk.available_space(), disk.total_space()))
}
