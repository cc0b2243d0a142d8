//! Synthesizes `CREATE TABLE ... WITH (...)` DDL from a `BeamSqlTable` and
//! composes full statement sets for the SQL gateway.
//!
//! Column names are escaped with backticks here; the field values are
//! expected to already be valid SQL fragments, e.g.
//! `value: STRING` becomes `` `value` STRING `` (`value` is an SQL keyword),
//! `dvalue: AS CAST(`value` AS DOUBLE)` is passed through as written.
//! Iteration follows the insertion order of the `fields` and `kafka`
//! mappings; downstream SQL depends on it.

use crate::crd::BeamSqlTable;
use kube::ResourceExt;
use serde_json::Value;
use snafu::Snafu;

/// The reserved field key emitted without backticks; its value is a full
/// WATERMARK clause body.
const WATERMARK_KEY: &str = "watermark";

/// Structural problems in a `BeamSqlTable` spec. These are user errors; the
/// DDL cannot be synthesized until the resource is edited.
#[derive(Debug, Snafu, Clone, PartialEq)]
pub enum DdlError {
    #[snafu(display("table '{}' has unsupported connector '{}'", table, connector))]
    UnsupportedConnector { table: String, connector: String },
    #[snafu(display("table '{}' has no format description", table))]
    MissingFormat { table: String },
    #[snafu(display("table '{}' has no kafka connector descriptor", table))]
    MissingKafka { table: String },
    #[snafu(display("table '{}' has no kafka topic", table))]
    MissingTopic { table: String },
    #[snafu(display("table '{}' has no kafka bootstrap servers", table))]
    MissingBootstrap { table: String },
}

/// Build the `CREATE TABLE` DDL for one table.
pub fn create_ddl(table: &BeamSqlTable) -> Result<String, DdlError> {
    let name = table.name();
    let spec = &table.spec;

    let mut ddl = format!("CREATE TABLE `{}` (", name);
    for (key, value) in &spec.fields {
        if key == WATERMARK_KEY {
            ddl.push_str(&format!("{} {},", key, value));
        } else {
            ddl.push_str(&format!("`{}` {},", key, value));
        }
    }
    if ddl.ends_with(',') {
        ddl.pop();
    }
    ddl.push_str(") WITH (");

    if spec.connector != "kafka" {
        return Err(DdlError::UnsupportedConnector {
            table: name,
            connector: spec.connector.clone(),
        });
    }
    ddl.push_str("'connector' = 'kafka'");

    if spec.format.is_empty() {
        return Err(DdlError::MissingFormat { table: name });
    }
    ddl.push_str(&format!(",'format' = '{}'", spec.format));

    if spec.kafka.is_empty() {
        return Err(DdlError::MissingKafka { table: name });
    }
    if scalar_entry(&spec.kafka, "topic").is_none() {
        return Err(DdlError::MissingTopic { table: name });
    }
    let bootstrap = spec
        .kafka
        .get("properties")
        .and_then(Value::as_object)
        .and_then(|properties| properties.get("bootstrap.servers"))
        .map(render_scalar)
        .filter(|servers| !servers.is_empty());
    if bootstrap.is_none() {
        return Err(DdlError::MissingBootstrap { table: name });
    }

    // The remaining kafka entries are copied through without validation.
    for (key, value) in &spec.kafka {
        if key == "properties" {
            if let Some(properties) = value.as_object() {
                for (property_key, property_value) in properties {
                    ddl.push_str(&format!(
                        ",'properties.{}' = '{}'",
                        property_key,
                        render_scalar(property_value)
                    ));
                }
            }
        } else {
            ddl.push_str(&format!(", '{}' = '{}'", key, render_scalar(value)));
        }
    }
    ddl.push_str(");");
    Ok(ddl)
}

/// Compose the full statement set submitted to the SQL gateway: the pipeline
/// name prolog, one DDL per referenced table, then the INSERT statements
/// wrapped in `BEGIN STATEMENT SET; ... END;`. An empty table list is valid.
pub fn compose_statement_set(
    namespace: &str,
    name: &str,
    ddls: &[String],
    statements: &[String],
) -> String {
    let mut set = format!("SET pipeline.name = '{}/{}';\n", namespace, name);
    for ddl in ddls {
        set.push_str(ddl);
        set.push('\n');
    }
    set.push_str("BEGIN STATEMENT SET;\n");
    for statement in statements {
        set.push_str(statement);
        set.push('\n');
    }
    set.push_str("END;");
    set
}

fn scalar_entry(kafka: &indexmap::IndexMap<String, Value>, key: &str) -> Option<String> {
    kafka
        .get(key)
        .map(render_scalar)
        .filter(|value| !value.is_empty())
}

/// Render a connector option value as it appears between the SQL quotes.
/// Strings render unquoted; other scalars use their JSON form.
fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::BeamSqlTableSpec;
    use indexmap::indexmap;
    use serde_json::json;

    fn table(spec: BeamSqlTableSpec) -> BeamSqlTable {
        BeamSqlTable::new("metrics", spec)
    }

    fn valid_spec() -> BeamSqlTableSpec {
        BeamSqlTableSpec {
            connector: "kafka".to_string(),
            format: "json".to_string(),
            fields: indexmap! {
                "metric".to_string() => "STRING".to_string(),
                "value".to_string() => "STRING".to_string(),
                "dvalue".to_string() => "AS CAST(`value` AS DOUBLE)".to_string(),
                "watermark".to_string() => "FOR `ts` AS `ts` - INTERVAL '5' SECOND".to_string(),
            },
            kafka: indexmap! {
                "topic".to_string() => json!("metrics"),
                "scan.startup.mode".to_string() => json!("latest-offset"),
                "properties".to_string() => json!({
                    "bootstrap.servers": "kafka:9092",
                    "group.id": "beam",
                }),
            },
        }
    }

    #[test]
    fn synthesizes_the_full_ddl() {
        let ddl = create_ddl(&table(valid_spec())).unwrap();
        assert_eq!(
            ddl,
            "CREATE TABLE `metrics` (`metric` STRING,`value` STRING,\
             `dvalue` AS CAST(`value` AS DOUBLE),\
             watermark FOR `ts` AS `ts` - INTERVAL '5' SECOND) WITH (\
             'connector' = 'kafka','format' = 'json', 'topic' = 'metrics', \
             'scan.startup.mode' = 'latest-offset',\
             'properties.bootstrap.servers' = 'kafka:9092',\
             'properties.group.id' = 'beam');"
        );
    }

    #[test]
    fn ddl_is_deterministic_in_insertion_order() {
        let first = create_ddl(&table(valid_spec())).unwrap();
        let second = create_ddl(&table(valid_spec())).unwrap();
        assert_eq!(first, second);

        let mut reordered = valid_spec();
        reordered.kafka = indexmap! {
            "properties".to_string() => json!({ "bootstrap.servers": "kafka:9092" }),
            "topic".to_string() => json!("metrics"),
        };
        let third = create_ddl(&table(reordered)).unwrap();
        assert_ne!(first, third);
        assert!(third.contains(
            "'properties.bootstrap.servers' = 'kafka:9092', 'topic' = 'metrics'"
        ));
    }

    #[test]
    fn rejects_non_kafka_connectors() {
        let mut spec = valid_spec();
        spec.connector = "jdbc".to_string();
        assert_eq!(
            create_ddl(&table(spec)),
            Err(DdlError::UnsupportedConnector {
                table: "metrics".to_string(),
                connector: "jdbc".to_string(),
            })
        );
    }

    #[test]
    fn rejects_missing_format() {
        let mut spec = valid_spec();
        spec.format = String::new();
        assert_eq!(
            create_ddl(&table(spec)),
            Err(DdlError::MissingFormat {
                table: "metrics".to_string(),
            })
        );
    }

    #[test]
    fn rejects_missing_kafka_descriptor() {
        let mut spec = valid_spec();
        spec.kafka = indexmap! {};
        assert_eq!(
            create_ddl(&table(spec)),
            Err(DdlError::MissingKafka {
                table: "metrics".to_string(),
            })
        );
    }

    #[test]
    fn rejects_missing_topic() {
        let mut spec = valid_spec();
        spec.kafka.remove("topic");
        assert_eq!(
            create_ddl(&table(spec)),
            Err(DdlError::MissingTopic {
                table: "metrics".to_string(),
            })
        );
    }

    #[test]
    fn rejects_missing_bootstrap_servers() {
        let mut spec = valid_spec();
        spec.kafka
            .insert("properties".to_string(), json!({ "group.id": "beam" }));
        assert_eq!(
            create_ddl(&table(spec)),
            Err(DdlError::MissingBootstrap {
                table: "metrics".to_string(),
            })
        );

        let mut spec = valid_spec();
        spec.kafka.remove("properties");
        assert_eq!(
            create_ddl(&table(spec)),
            Err(DdlError::MissingBootstrap {
                table: "metrics".to_string(),
            })
        );
    }

    #[test]
    fn empty_fields_still_produce_a_table() {
        let mut spec = valid_spec();
        spec.fields = indexmap! {};
        let ddl = create_ddl(&table(spec)).unwrap();
        assert!(ddl.starts_with("CREATE TABLE `metrics` () WITH ("));
    }

    #[test]
    fn statement_set_wraps_inserts() {
        let ddls = vec!["CREATE TABLE `t` () WITH ('connector' = 'kafka');".to_string()];
        let statements = vec!["INSERT INTO o SELECT * FROM t;".to_string()];
        let set = compose_statement_set("oisp", "rules", &ddls, &statements);
        assert_eq!(
            set,
            "SET pipeline.name = 'oisp/rules';\n\
             CREATE TABLE `t` () WITH ('connector' = 'kafka');\n\
             BEGIN STATEMENT SET;\n\
             INSERT INTO o SELECT * FROM t;\n\
             END;"
        );
    }

    #[test]
    fn statement_set_tolerates_no_tables() {
        let set = compose_statement_set("oisp", "rules", &[], &[]);
        assert_eq!(
            set,
            "SET pipeline.name = 'oisp/rules';\nBEGIN STATEMENT SET;\nEND;"
        );
    }
}
