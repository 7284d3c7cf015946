use nix::unistd::{setresgid, setresuid, Gid, Uid};
use std::io::Read;

/// Credentials a service runs with. Resolved in the parent, applied in the child.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
    pub supp_gids: Vec<Gid>,
    /// Whether the kernel lets us call setgroups (it might not inside user namespaces)
    pub can_set_groups: bool,
}

/// This sequence should drop all privileges the root process might have had.
/// Runs in the forked child, so it must not allocate or log.
pub fn drop_privileges(creds: &Credentials) -> Result<(), nix::errno::Errno> {
    setresgid(creds.gid, creds.gid, creds.gid)?;
    if creds.can_set_groups {
        nix::unistd::setgroups(&creds.supp_gids)?;
    }
    setresuid(creds.uid, creds.uid, creds.uid)?;
    Ok(())
}

const ALLOW_READ: [u8; 5] = [b'a', b'l', b'l', b'o', b'w'];

/// If the kernel says we cant drop groups they are ignored
pub fn can_drop_groups() -> Result<bool, String> {
    let kernel_iface_path = std::path::PathBuf::from("/proc/self/setgroups");

    if !kernel_iface_path.exists() {
        // assume true since we cant check
        Ok(true)
    } else {
        let mut buf = [0u8; 5];
        let mut file = std::fs::File::open(&kernel_iface_path).map_err(|e| {
            format!(
                "Error while opening file: {:?} to check if we can call setgroups: {}",
                kernel_iface_path, e
            )
        })?;
        file.read_exact(&mut buf[..]).map_err(|e| {
            format!(
                "Error while reading file: {:?} to check if we can call setgroups: {}",
                kernel_iface_path, e
            )
        })?;
        Ok(buf.eq(&ALLOW_READ))
    }
}
