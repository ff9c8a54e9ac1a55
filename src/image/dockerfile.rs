//! Dockerfiles the pipeline generates.

/// Throwaway cloner image: the git image with a shell entrypoint.
pub fn cloner(git_image: &str) -> String {
    format!(
        "FROM {git_image}\n\
         USER root\n\
         RUN git config --system --add safe.directory '*'\n\
         ENTRYPOINT [\"/bin/sh\", \"-c\"]\n"
    )
}

/// Language pack plus source, for running unit tests.
pub fn unittest(language_pack: &str) -> String {
    format!("FROM {language_pack}\nCOPY code /app\nWORKDIR /app\n")
}

/// Language pack plus source, with `build.sh` run at build time.
pub fn build(language_pack: &str) -> String {
    format!(
        "FROM {language_pack}\n\
         COPY code /app\n\
         COPY build.sh /slipway/build.sh\n\
         WORKDIR /app\n\
         RUN sh /slipway/build.sh\n"
    )
}

/// Final application image: the intermediate image with its start command.
pub fn final_image(intermediate: &str, run_cmd: Option<&str>) -> String {
    let mut out = format!("FROM {intermediate}\nWORKDIR /app\n");
    if let Some(cmd) = run_cmd.map(str::trim).filter(|c| !c.is_empty()) {
        let exec = serde_json::json!(["/bin/sh", "-c", cmd]);
        out.push_str(&format!("CMD {}\n", exec));
    }
    out
}

/// Script the build image runs; aborts on the first failing command.
pub fn build_script(build_cmd: &str) -> String {
    format!("#!/bin/sh\nset -e\n{}\n", build_cmd.trim())
}
