//! Wall clock helpers.

use anyhow::Error;

pub use proxmox_time::epoch_i64;

/// Format an epoch as local `YYYYMMDD`.
pub fn local_date_stamp(epoch: i64) -> Result<String, Error> {
    proxmox_time::strftime_local("%Y%m%d", epoch)
}
