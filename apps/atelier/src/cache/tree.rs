use workspace_proto::FileNode;

/// Depth-first, left-to-right visit of every node in the snapshot.
pub fn visit<'a>(nodes: &'a [FileNode], visit: &mut impl FnMut(&'a FileNode)) {
    for node in nodes {
        visit(node);
        if let Some(children) = &node.children {
            self::visit(children, visit);
        }
    }
}

/// All file paths in the snapshot, in deterministic tree order.
pub fn file_paths(nodes: &[FileNode]) -> Vec<String> {
    let mut paths = Vec::new();
    visit(nodes, &mut |node| {
        if node.is_file() {
            paths.push(node.path.clone());
        }
    });
    paths
}

/// File bodies some services attach directly to snapshot nodes.
pub fn inline_contents(nodes: &[FileNode]) -> Vec<(String, String)> {
    let mut found = Vec::new();
    visit(nodes, &mut |node| {
        if node.is_file() {
            if let Some(content) = &node.content {
                found.push((node.path.clone(), content.clone()));
            }
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use workspace_proto::NodeKind;

    fn file(path: &str) -> FileNode {
        FileNode {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            kind: NodeKind::File,
            children: None,
            content: None,
        }
    }

    fn dir(path: &str, children: Vec<FileNode>) -> FileNode {
        FileNode {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            kind: NodeKind::Directory,
            children: Some(children),
            content: None,
        }
    }

    #[test]
    fn file_paths_are_depth_first() {
        let tree = vec![
            dir(
                "src",
                vec![file("src/main.tsx"), dir("src/lib", vec![file("src/lib/util.ts")])],
            ),
            file("package.json"),
        ];
        assert_eq!(
            file_paths(&tree),
            vec!["src/main.tsx", "src/lib/util.ts", "package.json"]
        );
    }

    #[test]
    fn inline_contents_skips_directories_and_empty_nodes() {
        let mut with_body = file("index.html");
        with_body.content = Some("<html></html>".into());
        let tree = vec![dir("src", vec![file("src/main.tsx")]), with_body];
        assert_eq!(
            inline_contents(&tree),
            vec![("index.html".to_string(), "<html></html>".to_string())]
        );
    }
}
