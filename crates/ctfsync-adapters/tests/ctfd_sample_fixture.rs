use std::path::Path;

use ctfsync_adapters::{fetch_challenges, load_platform_fixture, FetchOptions, InMemoryPlatform};
use ctfsync_core::ConnectionKind;

fn sample_platform() -> InMemoryPlatform {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/ctfd-sample/platform.json");
    InMemoryPlatform::from_fixture(load_platform_fixture(path).expect("sample fixture"))
}

#[tokio::test]
async fn sample_fixture_normalizes_into_remote_model() {
    let platform = sample_platform();
    let snapshot = fetch_challenges(&platform, &FetchOptions::default())
        .await
        .expect("fetch");

    let names: Vec<&str> = snapshot.challenges.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["Baby RSA", "Sanity Check", "Echo Server", "Login Portal"]
    );
    assert!(snapshot.skipped.is_empty());

    let rsa = &snapshot.challenges[0];
    assert_eq!(rsa.files[0].name, "output.txt");
    assert_eq!(rsa.tags, vec!["rsa", "beginner"]);
    assert_eq!(rsa.hints[1].content.as_deref(), Some("Cube roots are cheap."));
    assert_eq!(rsa.max_attempts, Some(10));

    let sanity = &snapshot.challenges[1];
    assert!(sanity.solved);

    let echo = &snapshot.challenges[2];
    let connection = echo.connection().expect("connection info");
    assert_eq!(connection.kind, ConnectionKind::Netcat);
    assert_eq!(connection.port, Some(31337));

    let portal = &snapshot.challenges[3];
    assert_eq!(portal.files[0].url, "https://ctf.example.org/files/b77e/source.zip");
    assert_eq!(portal.kind, "dynamic");
    assert_eq!(platform.detail_calls(), 4);
}
