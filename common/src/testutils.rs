#[cfg(test)]
pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("hlab_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

#[cfg(test)]
pub async fn setup_test_dir() -> anyhow::Result<std::path::PathBuf> {
    // create a temporary directory
    let tmp_dir = create_temp_dir().await?;
    // src
    // |- show
    //    |- e01.mkv
    //    |- e02.mkv
    //    |- extras
    //       |- trailer.mkv
    // dst
    let show_path = tmp_dir.join("src").join("show");
    tokio::fs::create_dir_all(show_path.join("extras")).await?;
    tokio::fs::write(show_path.join("e01.mkv"), "e01").await?;
    tokio::fs::write(show_path.join("e02.mkv"), "e02").await?;
    tokio::fs::write(show_path.join("extras").join("trailer.mkv"), "trailer").await?;
    tokio::fs::create_dir(tmp_dir.join("dst")).await?;
    Ok(tmp_dir)
}

/// Output `rsync -rP --remove-source-files src/show dst` prints for the tree above.
#[cfg(test)]
pub const RSYNC_OUTPUT: [&str; 12] = [
    "sending incremental file list",
    "show/",
    "show/e01.mkv",
    "              3 100%    0.00kB/s    0:00:00 (xfr#1, to-chk=3/6)",
    "show/e02.mkv",
    "              3 100%    2.93kB/s    0:00:00 (xfr#2, to-chk=2/6)",
    "show/extras/",
    "show/extras/trailer.mkv",
    "              7 100%    6.84kB/s    0:00:00 (xfr#3, to-chk=0/6)",
    "",
    "sent 381 bytes  received 120 bytes  1,002.00 bytes/sec",
    "total size is 13  speedup is 0.03",
];
