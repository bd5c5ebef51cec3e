use assert_cmd::Command;
use bits_core::AnyEmptyResult;

#[test]
fn list_shows_every_element() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	std::fs::write(
		tmp.path().join("questions.yaml"),
		r"
constants:
  - name: gravity
    symbol: g
    value: 9.81
bits:
  - name: projectile
    tags: [kinematics]
    src: x
  - name: two-part
    src:
      question: q
      answer: a
targets:
  - name: exam
    template: exam.tex
    dest: out/exam.pdf
",
	)?;

	let mut cmd = Command::cargo_bin("bits")?;
	cmd.env("NO_COLOR", "1")
		.arg("list")
		.arg(tmp.path().join("questions.yaml"))
		.arg("--root")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(predicates::str::contains("projectile [kinematics]"))
		.stdout(predicates::str::contains("two-part (question, answer)"))
		.stdout(predicates::str::contains("gravity g = 9.81"))
		.stdout(predicates::str::contains("exam -> "))
		.stdout(predicates::str::contains("2 bit(s), 1 constant(s), 1 target(s)"));

	Ok(())
}

#[test]
fn list_empty_registry() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	std::fs::write(tmp.path().join("empty.yaml"), "")?;

	let mut cmd = Command::cargo_bin("bits")?;
	cmd.env("NO_COLOR", "1")
		.arg("list")
		.arg(tmp.path().join("empty.yaml"))
		.arg("--root")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(predicates::str::contains("No bits, constants or targets found."));

	Ok(())
}
