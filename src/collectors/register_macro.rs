macro_rules! register_collectors {
    (
        $(
            $name:ident => $collector_type:ident
        ),* $(,)?
    ) => {
        // Generate the enum with all collector types
        #[derive(Clone)]
        pub enum CollectorType {
            $(
                $collector_type($collector_type),
            )*
        }

        // Implement Collector trait for CollectorType enum
        impl Collector for CollectorType {
            fn name(&self) -> &'static str {
                match self {
                    $(
                        CollectorType::$collector_type(c) => c.name(),
                    )*
                }
            }

            fn group(&self) -> CollectorGroup {
                match self {
                    $(
                        CollectorType::$collector_type(c) => c.group(),
                    )*
                }
            }

            fn register_metrics(&self, registry: &Registry) -> Result<()> {
                match self {
                    $(
                        CollectorType::$collector_type(c) => c.register_metrics(registry),
                    )*
                }
            }

            fn collect<'a>(
                &'a self,
                pool: &'a PgPool,
                version: &'a Version,
            ) -> BoxFuture<'a, Result<()>> {
                match self {
                    $(
                        CollectorType::$collector_type(c) => c.collect(pool, version),
                    )*
                }
            }

            fn enabled_by_default(&self) -> bool {
                match self {
                    $(
                        CollectorType::$collector_type(c) => c.enabled_by_default(),
                    )*
                }
            }

            fn fail_on_error(&self) -> bool {
                match self {
                    $(
                        CollectorType::$collector_type(c) => c.fail_on_error(),
                    )*
                }
            }
        }

        // Generate the factory function map
        pub fn all_factories() -> HashMap<&'static str, fn() -> CollectorType> {
            let mut map: HashMap<&'static str, fn() -> CollectorType> = HashMap::new();
            $(
                map.insert(
                    stringify!($name),
                    || CollectorType::$collector_type($collector_type::new()),
                );
            )*
            map
        }

        // Generate array of collector names, in catalogue order - this drives
        // both the clap flags and the deterministic scrape order.
        pub const COLLECTOR_NAMES: &[&'static str] = &[
            $(stringify!($name),)*
        ];
    };
}
