use assert_cmd::Command;
use bits_core::AnyEmptyResult;

const REGISTRY: &str = r"
tags: [physics]
bits:
  - name: projectile
    tags: [kinematics]
    defaults:
      speed: 10
    presets:
      - name: fast
        context:
          speed: 30
    src: 'A ball is thrown at \VAR{ speed } m/s.'
targets:
  - name: exam
    template: exam.tex
    dest: out
    context:
      title: Midterm
    queries:
      blocks:
        where: { tags: [kinematics] }
        preset: fast
";

const TEMPLATE: &str = r"\VAR{ title }
\BLOCK{ for block in blocks }
\VAR{ block.render() }
\BLOCK{ endfor }
";

#[test]
fn build_writes_tex_without_compiling() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	std::fs::write(tmp.path().join("questions.yaml"), REGISTRY)?;
	std::fs::write(tmp.path().join("exam.tex"), TEMPLATE)?;

	let mut cmd = Command::cargo_bin("bits")?;
	cmd.env("NO_COLOR", "1")
		.arg("build")
		.arg(tmp.path().join("questions.yaml"))
		.arg("--tex")
		.arg("--no-pdf")
		.arg("--root")
		.arg(tmp.path())
		.assert()
		.success()
		.stdout(predicates::str::contains("questions-exam.tex"))
		.stdout(predicates::str::contains("Built 1 of 1 target(s)."));

	let content = std::fs::read_to_string(tmp.path().join("out/questions-exam.tex"))?;
	assert_eq!(content, "Midterm\nA ball is thrown at 30 m/s.\n");
	assert!(!tmp.path().join("out/questions-exam.pdf").exists());

	Ok(())
}

#[test]
fn build_uses_directory_index() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	std::fs::write(tmp.path().join("index.yml"), REGISTRY)?;
	std::fs::write(tmp.path().join("exam.tex"), TEMPLATE)?;

	let mut cmd = Command::cargo_bin("bits")?;
	cmd.env("NO_COLOR", "1")
		.arg("build")
		.arg(tmp.path())
		.arg("--tex")
		.arg("--no-pdf")
		.arg("--root")
		.arg(tmp.path())
		.assert()
		.success();

	assert!(tmp.path().join("out/index-exam.tex").is_file());

	Ok(())
}

#[test]
fn build_reads_defaults_from_config() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	std::fs::create_dir_all(tmp.path().join("templates"))?;
	std::fs::write(tmp.path().join("templates/default.tex"), "\\VAR{ course }\n")?;
	std::fs::write(
		tmp.path().join("bits.toml"),
		"[defaults]\ntemplate = \"templates/default.tex\"\ndest = \"build\"\n\n[variables]\ncourse = \"Physics 101\"\n",
	)?;
	std::fs::write(
		tmp.path().join("sheet.yaml"),
		"targets:\n  - name: sheet\n    context:\n      course: '${course}'\n",
	)?;

	let mut cmd = Command::cargo_bin("bits")?;
	cmd.env("NO_COLOR", "1")
		.arg("build")
		.arg(tmp.path().join("sheet.yaml"))
		.arg("--tex")
		.arg("--no-pdf")
		.arg("--root")
		.arg(tmp.path())
		.assert()
		.success();

	let content = std::fs::read_to_string(tmp.path().join("build/sheet-sheet.tex"))?;
	assert_eq!(content, "Physics 101\n");

	Ok(())
}

#[test]
fn build_reports_missing_registry() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;

	let mut cmd = Command::cargo_bin("bits")?;
	cmd.env("NO_COLOR", "1")
		.arg("build")
		.arg(tmp.path().join("missing.yaml"))
		.arg("--root")
		.arg(tmp.path())
		.assert()
		.code(2)
		.stderr(predicates::str::contains("registry not found"));

	Ok(())
}

#[test]
fn build_reports_extends_cycles() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	std::fs::write(
		tmp.path().join("cycle.yaml"),
		"targets:\n  - name: A\n    template: t.tex\n    extends: B\n  - name: B\n    extends: A\n",
	)?;

	let mut cmd = Command::cargo_bin("bits")?;
	cmd.env("NO_COLOR", "1")
		.arg("build")
		.arg(tmp.path().join("cycle.yaml"))
		.arg("--no-pdf")
		.arg("--root")
		.arg(tmp.path())
		.assert()
		.code(2)
		.stderr(predicates::str::contains("bits::registry_load"))
		.stderr(predicates::str::contains("cycle detected in target extends"));

	Ok(())
}
