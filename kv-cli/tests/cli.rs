#[cfg(test)]
mod test {
    use assert_cmd::prelude::*;
    use predicates::prelude::*;
    use std::process::Command;

    #[test]
    fn unknown_arg_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("kvcli")?;

        cmd.arg("foobar").arg("test/file/doesnt/exist");
        cmd.assert().failure().stderr(predicate::str::contains("unexpected argument"));

        Ok(())
    }

    #[test]
    fn query_flag_runs_non_interactively() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("kvcli")?;

        cmd.arg("--non-interactive").arg("--query=PUT greeting hello");
        cmd.assert().success();

        Ok(())
    }
}
