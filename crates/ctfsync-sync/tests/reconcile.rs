use std::path::{Path, PathBuf};

use ctfsync_adapters::{load_platform_fixture, FixtureChallenge, InMemoryPlatform};
use ctfsync_storage::{parse_flag_file, FsWorkspace, WorkspaceStore, FLAG_FILE, README_FILE};
use ctfsync_sync::{sync_status, sync_workspace, ReadmeChange, SyncError, SyncOptions};
use tempfile::tempdir;

const PROFILE: &str = "test";

fn sample_platform() -> InMemoryPlatform {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ctfd-sample/platform.json");
    InMemoryPlatform::from_fixture(load_platform_fixture(path).expect("sample fixture"))
}

fn read(root: &Path, rel: &str) -> String {
    std::fs::read_to_string(root.join(rel)).unwrap_or_else(|e| panic!("reading {rel}: {e}"))
}

fn readmes(root: &Path) -> Vec<(PathBuf, String)> {
    ["crypto/baby-rsa", "misc/sanity-check", "pwn/echo-server", "web/login-portal"]
        .iter()
        .map(|rel| {
            let path = root.join(rel).join(README_FILE);
            let text = std::fs::read_to_string(&path).expect("README present");
            (path, text)
        })
        .collect()
}

#[tokio::test]
async fn second_sync_is_byte_identical_and_downloads_nothing() {
    let dir = tempdir().expect("tempdir");
    let store = FsWorkspace::new(dir.path());
    let platform = sample_platform();
    let options = SyncOptions::default();

    let first = sync_workspace(&store, &platform, &options, PROFILE)
        .await
        .expect("first sync");
    assert_eq!(first.challenges.len(), 4);
    assert_eq!(first.downloaded(), 4);
    assert!(!first.is_partial());
    let before = readmes(dir.path());

    let second = sync_workspace(&store, &platform, &options, PROFILE)
        .await
        .expect("second sync");
    assert_eq!(second.downloaded(), 0);
    assert!(second
        .challenges
        .iter()
        .all(|c| c.readme == ReadmeChange::Unchanged && !c.created_dir));
    assert_eq!(second.challenges.iter().map(|c| c.already_present).sum::<usize>(), 4);
    assert_eq!(readmes(dir.path()), before);
    assert_eq!(platform.download_calls(), 4);

    let order: Vec<&str> = second.challenges.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(
        order,
        vec!["crypto/baby-rsa", "misc/sanity-check", "pwn/echo-server", "web/login-portal"]
    );
    assert_eq!(
        read(dir.path(), "pwn/echo-server/libc.so.6"),
        "\u{7f}ELF-libc"
    );
}

#[tokio::test]
async fn file_and_detail_failures_are_reported_not_fatal() {
    let dir = tempdir().expect("tempdir");
    let store = FsWorkspace::new(dir.path());
    let platform = sample_platform()
        .with_failing_detail(9)
        .with_failing_download("https://ctf.example.org/files/91aa/libc.so.6");

    let report = sync_workspace(&store, &platform, &SyncOptions::default(), PROFILE)
        .await
        .expect("partial sync still succeeds");

    assert_eq!(report.challenges.len(), 3);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].id, 9);
    assert_eq!(report.failures(), 2);
    assert!(report.is_partial());

    let echo = report
        .challenges
        .iter()
        .find(|c| c.id == 12)
        .expect("echo result");
    assert_eq!(echo.downloaded, 1);
    assert_eq!(echo.failures.len(), 1);
    assert!(dir.path().join("pwn/echo-server").join(FLAG_FILE).exists());
    assert!(!dir.path().join("web/login-portal").exists());

    let index = store.load_index().await.expect("index");
    assert!(index.challenges.contains_key(&12));
    assert!(!index.challenges.contains_key(&9));
    assert!(!index.challenges[&12].files.contains_key("libc.so.6"));
}

#[tokio::test]
async fn user_flag_is_kept_and_local_solve_shows_in_readme() {
    let dir = tempdir().expect("tempdir");
    let store = FsWorkspace::new(dir.path());
    let platform = sample_platform();
    let options = SyncOptions {
        include_files: false,
        ..SyncOptions::default()
    };

    sync_workspace(&store, &platform, &options, PROFILE)
        .await
        .expect("first sync");
    assert!(!dir.path().join("crypto/baby-rsa/output.txt").exists());

    let flag_path = dir.path().join("crypto/baby-rsa").join(FLAG_FILE);
    std::fs::write(&flag_path, "flag{work_in_progress}\n").unwrap();
    sync_workspace(&store, &platform, &options, PROFILE)
        .await
        .expect("second sync");
    assert_eq!(
        std::fs::read_to_string(&flag_path).unwrap(),
        "flag{work_in_progress}\n"
    );

    store
        .mark_solved(Path::new("crypto/baby-rsa"), "flag{cube_root_attack}")
        .await
        .unwrap();
    let report = sync_workspace(&store, &platform, &options, PROFILE)
        .await
        .expect("third sync");
    let rsa = report.challenges.iter().find(|c| c.id == 4).unwrap();
    assert!(rsa.solved);
    let readme = read(dir.path(), "crypto/baby-rsa/README.md");
    assert!(readme.contains("**Status:** SOLVED"));
    assert!(!readme.contains("UNSOLVED"));
}

#[tokio::test]
async fn unknown_category_yields_empty_report_with_suggestion() {
    let dir = tempdir().expect("tempdir");
    let store = FsWorkspace::new(dir.path());
    let platform = sample_platform();
    let options = SyncOptions {
        category_filter: Some("Cryto".into()),
        ..SyncOptions::default()
    };

    let report = sync_workspace(&store, &platform, &options, PROFILE)
        .await
        .expect("sync");
    assert!(report.challenges.is_empty());
    assert_eq!(report.suggestion.as_deref(), Some("crypto"));
    assert_eq!(platform.detail_calls(), 0);
}

#[tokio::test]
async fn unreachable_platform_aborts() {
    let dir = tempdir().expect("tempdir");
    let store = FsWorkspace::new(dir.path());
    let platform = InMemoryPlatform::new("https://ctf.example.org").unreachable();

    let err = sync_workspace(&store, &platform, &SyncOptions::default(), PROFILE)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Fetch(_)));
    assert!(!store.index_path().exists());
}

#[tokio::test]
async fn colliding_names_get_stable_distinct_paths_and_removed_challenges_stay() {
    let dir = tempdir().expect("tempdir");
    let store = FsWorkspace::new(dir.path());
    let challenge = |id: u64| FixtureChallenge {
        detail: serde_json::from_value(serde_json::json!({
            "id": id,
            "name": "Login",
            "category": "Web"
        }))
        .unwrap(),
        solved_by_me: false,
        flag: None,
    };

    let both = InMemoryPlatform::new("https://ctf.example.org")
        .with_challenge(challenge(3))
        .with_challenge(challenge(7));
    let report = sync_workspace(&store, &both, &SyncOptions::default(), PROFILE)
        .await
        .expect("sync");
    let paths: Vec<&str> = report.challenges.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(paths, vec!["web/login", "web/login-7"]);

    let only_seven = InMemoryPlatform::new("https://ctf.example.org").with_challenge(challenge(7));
    let report = sync_workspace(&store, &only_seven, &SyncOptions::default(), PROFILE)
        .await
        .expect("sync");
    assert_eq!(report.challenges[0].path, "web/login-7");
    assert!(dir.path().join("web/login").join(README_FILE).exists());

    let status = sync_status(&store).await.expect("status");
    assert_eq!(status.total, 2);
    assert_eq!(status.profile.as_deref(), Some(PROFILE));
}

#[tokio::test]
async fn attachments_named_like_generated_files_are_renamed() {
    let dir = tempdir().expect("tempdir");
    let store = FsWorkspace::new(dir.path());
    let leaky = FixtureChallenge {
        detail: serde_json::from_value(serde_json::json!({
            "id": 21,
            "name": "Leaky",
            "category": "Misc",
            "files": ["/files/aa/flag.txt", "/files/bb/README.md"]
        }))
        .unwrap(),
        solved_by_me: false,
        flag: None,
    };
    let platform = InMemoryPlatform::new("https://ctf.example.org")
        .with_challenge(leaky)
        .with_file("https://ctf.example.org/files/aa/flag.txt", b"flag{decoy}\n")
        .with_file("https://ctf.example.org/files/bb/README.md", b"# author notes\n");

    let report = sync_workspace(&store, &platform, &SyncOptions::default(), PROFILE)
        .await
        .expect("sync");
    assert_eq!(report.downloaded(), 2);
    assert_eq!(report.failures(), 0);

    let flag = read(dir.path(), "misc/leaky/flag.txt");
    assert!(flag.starts_with('#'));
    assert_eq!(parse_flag_file(&flag).candidate, None);
    assert_eq!(read(dir.path(), "misc/leaky/0_flag.txt"), "flag{decoy}\n");
    assert_eq!(read(dir.path(), "misc/leaky/1_README.md"), "# author notes\n");
    let readme = read(dir.path(), "misc/leaky/README.md");
    assert!(readme.contains("| Challenge ID | `21`"));
    assert!(readme.contains("0_flag.txt"));

    let again = sync_workspace(&store, &platform, &SyncOptions::default(), PROFILE)
        .await
        .expect("second sync");
    assert_eq!(again.downloaded(), 0);
    assert_eq!(read(dir.path(), "misc/leaky/flag.txt"), flag);
}

#[tokio::test]
async fn status_counts_solved_per_category() {
    let dir = tempdir().expect("tempdir");
    let store = FsWorkspace::new(dir.path());
    sync_workspace(&store, &sample_platform(), &SyncOptions::default(), PROFILE)
        .await
        .expect("sync");

    let status = sync_status(&store).await.expect("status");
    assert_eq!(status.total, 4);
    assert_eq!(status.solved, 1);
    let misc = status
        .categories
        .iter()
        .find(|c| c.category == "misc")
        .expect("misc row");
    assert_eq!((misc.total, misc.solved, misc.available), (1, 1, 0));
    assert!(status.last_sync.is_some());
}
