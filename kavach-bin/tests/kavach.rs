use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const EXEC_PATH: &str = env!("CARGO_BIN_EXE_kavach");

fn run(exec: &Path, args: &[&str], cwd: &Path) -> Output {
    println!("run '{} {}'", exec.display(), args.join(" "));
    Command::new(exec)
        .args(args)
        .current_dir(cwd)
        .env("KAVACH_LOG", "debug")
        .output()
        .unwrap_or_else(|err| panic!("Failed to invoke '{}': {}", exec.display(), err))
}

fn sample_tree(base: &Path) -> PathBuf {
    let root = base.join("data");
    fs::create_dir_all(root.join("nested/deeper")).unwrap();
    fs::create_dir_all(root.join("empty")).unwrap();
    fs::write(root.join("top.txt"), b"top level file\n").unwrap();
    fs::write(root.join("nested/zero"), b"").unwrap();
    fs::write(root.join("nested/deeper/blob"), vec![0x5au8; 70_000]).unwrap();
    root
}

fn relative_entries(root: &Path) -> Vec<(PathBuf, Option<Vec<u8>>)> {
    walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let rel = entry.path().strip_prefix(root).unwrap().to_owned();
            let contents = if entry.file_type().is_file() {
                Some(fs::read(entry.path()).unwrap())
            } else {
                None
            };
            (rel, contents)
        })
        .collect()
}

#[test]
fn kavach_pack_and_unpack() {
    let tmp = tempfile::tempdir().unwrap();
    let root = sample_tree(tmp.path());

    let output = run(
        Path::new(EXEC_PATH),
        &["pack", "data", "--output", "bundle", "--encrypt", "xor", "--key", "secret"],
        tmp.path(),
    );
    assert!(output.status.success(), "{:?}", output);

    let packed = tmp.path().join("bundle.kgs");
    assert!(packed.exists());

    let output = run(&packed, &["list"], tmp.path());
    assert!(output.status.success(), "{:?}", output);
    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.lines().any(|line| line == "data/nested/deeper/blob"));

    fs::create_dir(tmp.path().join("restore")).unwrap();
    let output = run(
        &packed,
        &["unpack", "--key", "secret", "--target-dir", "restore"],
        tmp.path(),
    );
    assert!(output.status.success(), "{:?}", output);

    let restored = tmp.path().join("restore/bundle.unpacked/data");
    assert_eq!(relative_entries(&root), relative_entries(&restored));
}

#[test]
fn kavach_exit_codes() {
    let tmp = tempfile::tempdir().unwrap();
    sample_tree(tmp.path());

    // the plain binary carries no archive
    let output = run(Path::new(EXEC_PATH), &["unpack"], tmp.path());
    assert_eq!(output.status.code(), Some(11), "{:?}", output);

    let output = run(Path::new(EXEC_PATH), &["pack", "missing"], tmp.path());
    assert_eq!(output.status.code(), Some(10), "{:?}", output);

    let output = run(
        Path::new(EXEC_PATH),
        &["pack", "data", "--encrypt", "xor", "--key", "k"],
        tmp.path(),
    );
    assert!(output.status.success(), "{:?}", output);

    let packed = tmp.path().join("data.kgs");
    let output = run(&packed, &["unpack"], tmp.path());
    assert_eq!(output.status.code(), Some(12), "{:?}", output);
    assert!(!tmp.path().join("data.unpacked").exists());

    let output = run(&packed, &["unpack", "--key", "k"], tmp.path());
    assert!(output.status.success(), "{:?}", output);

    let output = run(&packed, &["unpack", "--key", "k"], tmp.path());
    assert_eq!(output.status.code(), Some(12), "{:?}", output);

    // command line errors exit with neither success nor a failure class
    let class_codes = [Some(0), Some(10), Some(11), Some(12)];
    let output = run(Path::new(EXEC_PATH), &["frobnicate"], tmp.path());
    assert!(!class_codes.contains(&output.status.code()), "{:?}", output);

    let output = run(
        Path::new(EXEC_PATH),
        &["pack", "data", "--encrypt", "rot13"],
        tmp.path(),
    );
    assert!(!class_codes.contains(&output.status.code()), "{:?}", output);
}
