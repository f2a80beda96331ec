use std::time::Duration;

use workspace_proto::{ClientCommand, ServerEvent};

use crate::cache::WorkspaceCache;
use crate::prefetch::{PrefetchScheduler, plan};
use crate::tests::support::{RecordingSink, dir_node, file_node, sample_tree};

#[test]
fn plan_orders_configs_then_entries_then_sources() {
    let tree = vec![
        dir_node(
            "src",
            vec![
                file_node("src/main.tsx"),
                file_node("src/App.tsx"),
                file_node("src/index.css"),
                file_node("src/extra.ts"),
            ],
        ),
        file_node("package.json"),
        file_node("vite.config.ts"),
        file_node("README.md"),
    ];

    let candidates = plan(&tree);
    assert_eq!(
        candidates,
        vec![
            "package.json",
            "vite.config.ts",
            "src/main.tsx",
            "src/App.tsx",
            "src/index.css",
            "src/extra.ts",
        ]
    );
}

#[test]
fn plan_takes_the_first_entry_match_in_tree_order() {
    let tree = vec![
        dir_node("a", vec![file_node("a/main.tsx")]),
        dir_node("b", vec![file_node("b/main.tsx")]),
    ];
    let candidates = plan(&tree);
    assert_eq!(candidates[0], "a/main.tsx");
}

#[test]
fn plan_matches_configs_in_nested_directories() {
    let tree = vec![dir_node("app", vec![file_node("app/package.json")])];
    assert_eq!(plan(&tree), vec!["app/package.json"]);
}

#[test_timeout::tokio_timeout_test]
async fn run_issues_one_silent_request_per_candidate() {
    let (cache, _notices) = WorkspaceCache::new();
    cache.apply_event(ServerEvent::Tree {
        items: sample_tree(),
    });
    let sink = RecordingSink::new();
    let scheduler = PrefetchScheduler::new(Duration::from_millis(1));

    scheduler.run(&cache, &sink).await;

    let commands = sink.commands();
    assert_eq!(commands.len(), 3);
    for command in &commands {
        let ClientCommand::OpenFile { silent, .. } = command else {
            panic!("unexpected command {command:?}");
        };
        assert!(*silent);
    }
    let paths: Vec<String> = commands
        .iter()
        .map(|command| match command {
            ClientCommand::OpenFile { path, .. } => path.clone(),
            other => panic!("unexpected command {other:?}"),
        })
        .collect();
    assert_eq!(paths, vec!["package.json", "src/main.tsx", "src/App.tsx"]);
}

#[test_timeout::tokio_timeout_test]
async fn run_fires_only_once_per_scheduler() {
    let (cache, _notices) = WorkspaceCache::new();
    cache.apply_event(ServerEvent::Tree {
        items: sample_tree(),
    });
    let sink = RecordingSink::new();
    let scheduler = PrefetchScheduler::new(Duration::from_millis(1));

    scheduler.run(&cache, &sink).await;
    scheduler.run(&cache, &sink).await;

    assert_eq!(sink.commands().len(), 3);
}

#[test_timeout::tokio_timeout_test]
async fn run_skips_paths_already_pending() {
    let (cache, _notices) = WorkspaceCache::new();
    cache.apply_event(ServerEvent::Tree {
        items: sample_tree(),
    });
    assert!(cache.mark_silent("src/main.tsx"));
    let sink = RecordingSink::new();
    let scheduler = PrefetchScheduler::new(Duration::from_millis(1));

    scheduler.run(&cache, &sink).await;

    let paths: Vec<String> = sink
        .commands()
        .iter()
        .map(|command| match command {
            ClientCommand::OpenFile { path, .. } => path.clone(),
            other => panic!("unexpected command {other:?}"),
        })
        .collect();
    assert_eq!(paths, vec!["package.json", "src/App.tsx"]);
}

#[test_timeout::tokio_timeout_test]
async fn prefetched_responses_leave_the_selection_alone() {
    let (cache, _notices) = WorkspaceCache::new();
    cache.apply_event(ServerEvent::Tree {
        items: sample_tree(),
    });
    let sink = RecordingSink::new();
    let scheduler = PrefetchScheduler::new(Duration::from_millis(1));
    scheduler.run(&cache, &sink).await;

    for command in sink.commands() {
        if let ClientCommand::OpenFile { path, .. } = command {
            cache.apply_event(ServerEvent::FileContent {
                content: format!("// {path}"),
                path,
            });
        }
    }

    assert_eq!(cache.active_file(), None);
    assert!(!cache.is_file_loading());
    assert!(cache.has_file("package.json"));
    assert!(cache.has_file("src/main.tsx"));
    assert!(cache.has_file("src/App.tsx"));
}
