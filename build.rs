use std::process::Command;

fn main() {
    // Stamp the benchmark output with the current commit
    let git_hash = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_COMMIT_HASH={}", git_hash);

    // rebuild if there is a commit
    println!("cargo:rerun-if-changed=.git/HEAD");
}
