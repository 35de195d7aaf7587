//! End-to-end CLI command tests against a temporary projects root.

use std::path::Path;
use tempfile::TempDir;
use trellis_cli::{commands, OutputFormat};
use trellis_core::{Framework, NodeKind, TrellisConfig};
use trellis_vfs::ArchiveCodec;

fn config_in(root: &Path) -> TrellisConfig {
    let mut config = TrellisConfig::default();
    config.workspace.projects_dir = root.join("projects");
    config.sync.max_workers = 2;
    config
}

#[tokio::test]
async fn test_init_add_connect_remove() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let archive = temp.path().join("demo.trellis");
    let format = OutputFormat::Plain;

    commands::init_workspace(&config, archive.clone(), Some("Demo".to_string()), false, format)
        .await
        .unwrap();
    assert!(archive.is_file());

    commands::node_add(&config, archive.clone(), "api".into(), Framework::Flask, NodeKind::Backend, 0.0, 0.0, format)
        .await
        .unwrap();
    commands::node_add(&config, archive.clone(), "web".into(), Framework::React, NodeKind::Frontend, 200.0, -40.0, format)
        .await
        .unwrap();
    commands::connect(&config, archive.clone(), "web".into(), "api".into(), format)
        .await
        .unwrap();

    let summary = ArchiveCodec::default().inspect(&archive).await.unwrap();
    assert_eq!(summary.name, "Demo");
    assert_eq!(summary.nodes.len(), 2);
    let web = summary.nodes.iter().find(|n| n.name == "web").unwrap();
    assert_eq!(web.connections, 1);
    let api = summary.nodes.iter().find(|n| n.name == "api").unwrap();
    assert!(api.archived_files >= 1);
    assert!(temp.path().join("projects/Demo/api/app.py").is_file());

    commands::node_remove(&config, archive.clone(), "api".into(), format)
        .await
        .unwrap();
    let summary = ArchiveCodec::default().inspect(&archive).await.unwrap();
    assert_eq!(summary.nodes.len(), 1);
    assert_eq!(summary.nodes[0].connections, 0);
    assert!(temp.path().join("projects/Demo/api").is_dir());
}

#[tokio::test]
async fn test_init_refuses_to_overwrite() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let archive = temp.path().join("demo.trellis");

    commands::init_workspace(&config, archive.clone(), None, false, OutputFormat::Plain)
        .await
        .unwrap();
    assert!(
        commands::init_workspace(&config, archive.clone(), None, false, OutputFormat::Plain)
            .await
            .is_err()
    );
    commands::init_workspace(&config, archive, None, true, OutputFormat::Plain)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_duplicate_node_name_rejected() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let archive = temp.path().join("demo.trellis");
    let format = OutputFormat::Plain;

    commands::init_workspace(&config, archive.clone(), None, false, format)
        .await
        .unwrap();
    commands::node_add(&config, archive.clone(), "svc".into(), Framework::Go, NodeKind::Service, 0.0, 0.0, format)
        .await
        .unwrap();
    let err = commands::node_add(&config, archive.clone(), "SVC".into(), Framework::Rust, NodeKind::Service, 0.0, 0.0, format)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to add node"));
}

#[tokio::test]
async fn test_restore_into_fresh_root() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let archive = temp.path().join("demo.trellis");
    let format = OutputFormat::Plain;

    commands::init_workspace(&config, archive.clone(), Some("Demo".to_string()), false, format)
        .await
        .unwrap();
    commands::node_add(&config, archive.clone(), "site".into(), Framework::Html, NodeKind::Frontend, 0.0, 0.0, format)
        .await
        .unwrap();

    let elsewhere = TempDir::new().unwrap();
    let restore_config = config_in(elsewhere.path());
    commands::restore(&restore_config, archive, format).await.unwrap();
    assert!(elsewhere.path().join("projects/Demo/site/index.html").is_file());
}

#[tokio::test]
async fn test_open_missing_archive_fails() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let err = commands::node_list(&config, temp.path().join("missing.trellis"), OutputFormat::Plain)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to open workspace"));
}

#[tokio::test]
async fn test_disk_edits_survive_commands_and_reach_archive() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let archive = temp.path().join("demo.trellis");
    let format = OutputFormat::Plain;
    let project = temp.path().join("projects/Demo/svc");

    commands::init_workspace(&config, archive.clone(), Some("Demo".to_string()), false, format)
        .await
        .unwrap();
    commands::node_add(&config, archive.clone(), "svc".into(), Framework::Go, NodeKind::Service, 0.0, 0.0, format)
        .await
        .unwrap();

    std::fs::write(project.join("main.go"), "package main // my edit").unwrap();
    std::fs::write(project.join("notes.md"), "v1").unwrap();

    commands::node_list(&config, archive.clone(), format).await.unwrap();
    commands::node_show(&config, archive.clone(), "svc".into(), format)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(project.join("main.go")).unwrap(),
        "package main // my edit"
    );

    // A mutating command keeps the directory and archives what is on disk.
    commands::node_add(&config, archive.clone(), "web".into(), Framework::Html, NodeKind::Frontend, 0.0, 0.0, format)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(project.join("main.go")).unwrap(),
        "package main // my edit"
    );
    let workspace = ArchiveCodec::default().read_workspace(&archive).await.unwrap();
    let svc = workspace.nodes.iter().find(|n| n.name == "svc").unwrap();
    assert_eq!(svc.file_by_path("main.go").unwrap().content, "package main // my edit");

    std::fs::write(project.join("notes.md"), "v2 edit").unwrap();
    commands::node_show(&config, archive.clone(), "svc".into(), format)
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(project.join("notes.md")).unwrap(), "v2 edit");

    commands::sync(&config, archive.clone(), format).await.unwrap();
    let extracted = ArchiveCodec::default().extract(&archive).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(extracted.node_dir(svc.id).join("notes.md")).unwrap(),
        "v2 edit"
    );
}

#[tokio::test]
async fn test_repeated_connect_leaves_archive_alone() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let archive = temp.path().join("demo.trellis");
    let format = OutputFormat::Plain;

    commands::init_workspace(&config, archive.clone(), None, false, format)
        .await
        .unwrap();
    commands::node_add(&config, archive.clone(), "a".into(), Framework::Go, NodeKind::Service, 0.0, 0.0, format)
        .await
        .unwrap();
    commands::node_add(&config, archive.clone(), "b".into(), Framework::Go, NodeKind::Service, 0.0, 0.0, format)
        .await
        .unwrap();
    commands::connect(&config, archive.clone(), "a".into(), "b".into(), format)
        .await
        .unwrap();

    let before = std::fs::read(&archive).unwrap();
    commands::connect(&config, archive.clone(), "a".into(), "b".into(), format)
        .await
        .unwrap();
    commands::disconnect(&config, archive.clone(), "b".into(), "a".into(), format)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&archive).unwrap(), before);
}
