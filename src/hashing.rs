//! Content hashing for fragments.
//!
//! A fragment's verification hash is computed over its sorted file tree:
//! a file contributes `H(relative_path_unix || H(bytes))`, a directory
//! contributes `H(concat of H(basename || child_hash) over sorted children)`,
//! and the tree hash is the root directory's contribution. `H` is SHA-512;
//! all hashes are lowercase hex. The resulting hash is embedded in the
//! fragment as `module.json` and compared after extraction.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha512};

use crate::error::{FragmenterError, FragmenterResult};
use crate::manifest::MODULE_JSON_FILE;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-512 of a byte slice, lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// SHA-512 of a file's contents, lowercase hex.
pub fn hash_file_contents(path: &Path) -> FragmenterResult<String> {
    let mut file = File::open(path).map_err(|e| FragmenterError::from_io(&e, path))?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| FragmenterError::from_io(&e, path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash one file as it contributes to a tree hash:
/// `H(relative_path_unix || H(bytes))`.
pub fn hash_tree_file(root: &Path, path: &Path) -> FragmenterResult<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| {
            FragmenterError::new(
                crate::error::ErrorCode::InvalidParameters,
                format!("{} is not under {}", path.display(), root.display()),
            )
        })?
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let contents = hash_file_contents(path)?;
    let mut hasher = Sha512::new();
    hasher.update(relative.as_bytes());
    hasher.update(contents.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a directory tree.
///
/// `module.json` at the root is excluded, since the hash is recorded there
/// after it is computed. The walk is sorted by file name at every level,
/// so the result is independent of filesystem enumeration order.
pub fn hash_tree(root: &Path) -> FragmenterResult<String> {
    hash_dir(root, root, true)
}

fn hash_dir(root: &Path, dir: &Path, is_root: bool) -> FragmenterResult<String> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| FragmenterError::from_io(&e, dir))?
        .collect::<Result<_, _>>()
        .map_err(|e| FragmenterError::from_io(&e, dir))?;
    entries.sort_by_key(|e| e.file_name());

    let mut hasher = Sha512::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_root && name == MODULE_JSON_FILE {
            continue;
        }
        let path = entry.path();
        let child_hash = if path.is_dir() {
            hash_dir(root, &path, false)?
        } else {
            hash_tree_file(root, &path)?
        };

        let mut entry_hasher = Sha512::new();
        entry_hasher.update(name.as_bytes());
        entry_hasher.update(child_hash.as_bytes());
        hasher.update(format!("{:x}", entry_hasher.finalize()).as_bytes());
    }

    Ok(format!("{:x}", hasher.finalize()))
}
