//! Conversion between the flat cache representation and the nested mount
//! format the sandbox runtime expects: slash-delimited path segments become
//! nested directory objects, the terminal segment becomes a file object
//! holding its contents.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBody {
    pub contents: String,
}

/// One entry in the mount format. Serializes externally tagged, matching the
/// boundary contract: `{"file":{"contents":…}}` / `{"directory":{…}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountEntry {
    File(FileBody),
    Directory(MountTree),
}

pub type MountTree = BTreeMap<String, MountEntry>;

/// Build the nested mount tree from a flat path→content map.
pub fn build_mount_tree(files: &HashMap<String, String>) -> MountTree {
    let mut root = MountTree::new();
    for (path, content) in files {
        insert_path(&mut root, path, content);
    }
    root
}

fn insert_path(root: &mut MountTree, path: &str, content: &str) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((leaf, branches)) = segments.split_last() else {
        return;
    };
    let mut current = root;
    for segment in branches {
        // a file squatting on a directory name loses to the directory
        if !matches!(current.get(*segment), Some(MountEntry::Directory(_))) {
            current.insert((*segment).to_string(), MountEntry::Directory(MountTree::new()));
        }
        let Some(MountEntry::Directory(children)) = current.get_mut(*segment) else {
            return;
        };
        current = children;
    }
    current.insert(
        (*leaf).to_string(),
        MountEntry::File(FileBody {
            contents: content.to_string(),
        }),
    );
}

/// Flatten a mount tree back to path→content pairs.
pub fn flatten(tree: &MountTree) -> Vec<(String, String)> {
    let mut flat = Vec::new();
    flatten_into("", tree, &mut flat);
    flat
}

fn flatten_into(prefix: &str, tree: &MountTree, flat: &mut Vec<(String, String)>) {
    for (name, entry) in tree {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        match entry {
            MountEntry::File(body) => flat.push((path, body.contents.clone())),
            MountEntry::Directory(children) => flatten_into(&path, children, flat),
        }
    }
}
