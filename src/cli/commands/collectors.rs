use crate::collectors::{COLLECTOR_NAMES, Collector, all_factories};
use clap::{Arg, Command};

pub fn add_collectors_args(mut cmd: Command) -> Command {
    let factories = all_factories();

    for &name in COLLECTOR_NAMES {
        // Get the default enabled state from the collector
        let default_enabled = factories.get(name).is_some_and(|f| f().enabled_by_default());

        // Create flag names
        let enable_flag: &'static str = Box::leak(format!("collector.{name}").into_boxed_str());
        let disable_flag: &'static str = Box::leak(format!("no-collector.{name}").into_boxed_str());

        let default_indicator = if default_enabled {
            " [default: enabled]"
        } else {
            " [default: disabled]"
        };
        let enable_help: &'static str =
            Box::leak(format!("Enable the {name} collector{default_indicator}").into_boxed_str());
        let disable_help: &'static str =
            Box::leak(format!("Disable the {name} collector").into_boxed_str());

        cmd = cmd
            .arg(
                Arg::new(enable_flag)
                    .long(enable_flag)
                    .help(enable_help)
                    .action(clap::ArgAction::SetTrue)
                    .default_value(if default_enabled { "true" } else { "false" })
                    .overrides_with(disable_flag),
            )
            .arg(
                Arg::new(disable_flag)
                    .long(disable_flag)
                    .help(disable_help)
                    .action(clap::ArgAction::SetTrue)
                    .overrides_with(enable_flag),
            );
    }
    cmd
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use crate::cli::dispatch::get_enabled_collectors;

    #[test]
    fn test_all_collector_flags_are_added() {
        let cmd = commands::new();
        let matches = cmd
            .try_get_matches_from(vec!["greengage_exporter"])
            .unwrap();

        for &name in COLLECTOR_NAMES {
            assert!(
                matches.contains_id(&format!("collector.{name}")),
                "Missing enable flag for {name}"
            );
            assert!(
                matches.contains_id(&format!("no-collector.{name}")),
                "Missing disable flag for {name}"
            );
        }
    }

    #[test]
    fn test_collector_default_values() {
        let cmd = commands::new();
        let matches = cmd.get_matches_from(vec!["greengage_exporter"]);

        let factories = all_factories();

        for &name in COLLECTOR_NAMES {
            let expected = factories.get(name).map(|f| f().enabled_by_default()).unwrap();
            let actual = matches.get_flag(&format!("collector.{name}"));
            assert_eq!(actual, expected, "collector '{name}' default mismatch");
        }
    }

    #[test]
    fn test_disable_wins_when_last() {
        let cmd = commands::new();
        let matches = cmd.get_matches_from(vec![
            "greengage_exporter",
            "--collector.segments",
            "--no-collector.segments",
        ]);

        let enabled = get_enabled_collectors(&matches);
        assert!(!enabled.contains(&"segments".to_string()));
    }

    #[test]
    fn test_enable_wins_when_last() {
        let cmd = commands::new();
        let matches = cmd.get_matches_from(vec![
            "greengage_exporter",
            "--no-collector.segments",
            "--collector.segments",
        ]);

        let enabled = get_enabled_collectors(&matches);
        assert!(enabled.contains(&"segments".to_string()));
    }

    #[test]
    fn test_opt_in_collector_can_be_enabled() {
        let cmd = commands::new();
        let matches =
            cmd.get_matches_from(vec!["greengage_exporter", "--collector.table_health"]);

        let enabled = get_enabled_collectors(&matches);
        assert!(enabled.contains(&"table_health".to_string()));
    }

    #[test]
    fn test_multiple_collectors_can_be_disabled() {
        let cmd = commands::new();
        let matches = cmd.get_matches_from(vec![
            "greengage_exporter",
            "--no-collector.locks",
            "--no-collector.extended_locks",
        ]);

        let enabled = get_enabled_collectors(&matches);
        assert!(!enabled.contains(&"locks".to_string()));
        assert!(!enabled.contains(&"extended_locks".to_string()));
        assert!(enabled.contains(&"segments".to_string()));
    }

    #[test]
    fn test_help_mentions_every_collector() {
        let mut cmd = commands::new();
        let long_help = cmd.render_long_help().to_string();

        for &name in COLLECTOR_NAMES {
            assert!(
                long_help.contains(name),
                "Help text should mention collector '{name}'"
            );
        }
    }
}
