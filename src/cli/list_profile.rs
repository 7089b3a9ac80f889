use std::io::{self, Write};

use anyhow::Context;

use super::CliContext;
use autorc::vehicle::list_profiles;

pub fn execute(context: &CliContext) -> anyhow::Result<()> {
    let root = &context.settings.profiles_root;
    let names = list_profiles(root).with_context(|| format!("listing profiles in {}", root.display()))?;
    print_profiles(&mut io::stdout().lock(), &names)?;
    Ok(())
}

fn print_profiles(out: &mut impl Write, names: &[String]) -> io::Result<()> {
    writeln!(out, "Available profiles:")?;
    for name in names {
        writeln!(out, "  {name}")?;
    }
    writeln!(out)?;
    writeln!(out, "Usage: autorc -p <profile> start")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_header_names_and_usage() {
        let mut out = Vec::new();
        print_profiles(&mut out, &["default".into(), "demo".into()]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Available profiles:\n  default\n  demo\n"));
        assert!(text.contains("autorc -p <profile> start"));
    }
}
