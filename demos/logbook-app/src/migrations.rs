//! Revisions of the logbook schema: nodes and the log records attached to
//! them.
//!
//! Revision `1.0.24` moves log records from a loose `(objpk, objname)` pair
//! to a real `dbnode_id` column and gives every record a UUID. Records that
//! belong to legacy workflows, to unknown entities, or to nodes that no longer
//! exist cannot be carried over; they are exported and deleted.

use revisio::{
    Error, ExportName, FieldDef, FieldType, Operation, Predicate, Revision, RevisionRegistry, Row,
    RowAccess, RowMutation, Value,
};

pub const LOG_TABLE: &str = "db_dblog";
pub const NODE_TABLE: &str = "db_dbnode";

const LEGACY_WORKFLOW_LOGS: &str = "objname LIKE 'aiida.workflows.user.%'";
const UNKNOWN_ENTITY_LOGS: &str =
    "objname NOT LIKE 'node.%' AND objname NOT LIKE 'aiida.workflows.user.%'";
const LOGS_WITHOUT_NODE: &str = "objname LIKE 'node.%' AND NOT EXISTS \
     (SELECT 1 FROM db_dbnode WHERE db_dbnode.id = db_dblog.objpk LIMIT 1)";

/// Every revision, oldest first.
pub fn registry() -> RevisionRegistry {
    RevisionRegistry::new(vec![
        Revision::root("1.0.22").description("baseline"),
        create_tables(),
        dblog_update(),
    ])
}

fn create_tables() -> Revision {
    Revision::new("1.0.23", "1.0.22")
        .description("node and log tables")
        .operation(
            Operation::raw(
                "CREATE TABLE db_dbnode (
                     id INTEGER PRIMARY KEY,
                     uuid TEXT NOT NULL UNIQUE,
                     type TEXT NOT NULL DEFAULT ''
                 );
                 CREATE TABLE db_dblog (
                     id INTEGER PRIMARY KEY,
                     time TEXT NOT NULL,
                     loggername TEXT NOT NULL,
                     levelname TEXT NOT NULL,
                     objpk INTEGER,
                     objname TEXT,
                     message TEXT NOT NULL DEFAULT '',
                     metadata TEXT NOT NULL DEFAULT '{}'
                 );",
            )
            .reverse("DROP TABLE db_dblog; DROP TABLE db_dbnode;"),
        )
}

fn dblog_update() -> Revision {
    let dbnode = FieldDef::new("dbnode_id", FieldType::Integer).references(NODE_TABLE, "id");
    let uuid = FieldDef::new("uuid", FieldType::Uuid);

    Revision::new("1.0.24", "1.0.23")
        .description("log records reference nodes and carry a uuid")
        // exported rows are not re-imported on downgrade
        .operation(
            Operation::delete_rows(Predicate::matching(LOG_TABLE, LEGACY_WORKFLOW_LOGS))
                .export_as(ExportName::new("legacy_wf_logs-", ".log"))
                .reverse_noop(),
        )
        .operation(
            Operation::delete_rows(Predicate::matching(LOG_TABLE, UNKNOWN_ENTITY_LOGS))
                .export_as(ExportName::new("unknown_entity_logs-", ".log"))
                .reverse_noop(),
        )
        .operation(
            Operation::delete_rows(Predicate::matching(LOG_TABLE, LOGS_WITHOUT_NODE))
                .export_as(ExportName::new("no_node_entity_logs-", ".log"))
                .reverse_noop(),
        )
        .operation(
            Operation::callback("clean_dblog_metadata", clean_metadata)
                .reverse(enrich_metadata),
        )
        // objname is only repopulated on the way back
        .operation(Operation::raw("").reverse(
            "UPDATE db_dblog SET objname = db_dbnode.type \
             FROM db_dbnode WHERE db_dbnode.id = db_dblog.objpk",
        ))
        .operation(Operation::remove_field(
            LOG_TABLE,
            FieldDef::new("objname", FieldType::Text),
        ))
        .operation(Operation::add_field(LOG_TABLE, dbnode.clone()))
        .operation(
            Operation::raw("UPDATE db_dblog SET dbnode_id = objpk")
                .reverse("UPDATE db_dblog SET objpk = dbnode_id"),
        )
        .operation(Operation::alter_field(
            LOG_TABLE,
            dbnode.clone(),
            dbnode.not_null(),
        ))
        .operation(Operation::remove_field(
            LOG_TABLE,
            FieldDef::new("objpk", FieldType::Integer),
        ))
        .operation(Operation::add_field(LOG_TABLE, uuid.clone()))
        .operation(Operation::callback("set_new_uuid", set_new_uuid).reverse_noop())
        .operation(Operation::alter_field(
            LOG_TABLE,
            uuid.clone(),
            uuid.not_null().unique(),
        ))
}

/// Apply `edit` to the parsed metadata of every log record and write back the
/// records it changed.
fn rewrite_metadata(
    rows: &dyn RowAccess,
    mutate: &dyn RowMutation,
    edit: &dyn Fn(&Row, &mut serde_json::Map<String, serde_json::Value>) -> bool,
) -> Result<(), Error> {
    rows.for_each_row(&Predicate::all(LOG_TABLE), &mut |row| {
        let Some(text) = row.get("metadata").and_then(Value::as_str) else {
            return Ok(());
        };
        let mut metadata: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        if edit(row, &mut metadata) {
            let id = row.get("id").cloned().unwrap_or(Value::Null);
            mutate.update(
                LOG_TABLE,
                ("id", &id),
                &[("metadata", Value::from(serde_json::to_string(&metadata)?))],
            )?;
        }
        Ok(())
    })
}

/// Drop the `objpk` and `objname` keys duplicated into each record's metadata.
fn clean_metadata(rows: &dyn RowAccess, mutate: &dyn RowMutation) -> Result<(), Error> {
    rewrite_metadata(rows, mutate, &|_, metadata| {
        let had_pk = metadata.remove("objpk").is_some();
        let had_name = metadata.remove("objname").is_some();
        had_pk || had_name
    })
}

/// Put `objpk` and `objname` back into the metadata from the record's columns.
fn enrich_metadata(rows: &dyn RowAccess, mutate: &dyn RowMutation) -> Result<(), Error> {
    rewrite_metadata(rows, mutate, &|row, metadata| {
        let mut changed = false;
        for key in ["objpk", "objname"] {
            if !metadata.contains_key(key) {
                let value = row.get(key).map(to_json).unwrap_or(serde_json::Value::Null);
                metadata.insert(key.to_string(), value);
                changed = true;
            }
        }
        changed
    })
}

fn set_new_uuid(rows: &dyn RowAccess, mutate: &dyn RowMutation) -> Result<(), Error> {
    rows.for_each_row(&Predicate::all(LOG_TABLE), &mut |row| {
        let id = row.get("id").cloned().unwrap_or(Value::Null);
        mutate.update(
            LOG_TABLE,
            ("id", &id),
            &[("uuid", Value::from(uuid::Uuid::new_v4().to_string()))],
        )?;
        Ok(())
    })
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Real(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::from(s.as_str()),
        Value::Blob(b) => serde_json::Value::from(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revisio::testing::{ScriptedConfirm, TestHarness};

    fn seeded() -> TestHarness {
        let mut harness = TestHarness::new(registry());
        harness.migrate_to("1.0.23").unwrap();
        harness
            .execute(
                "INSERT INTO db_dbnode (id, uuid, type) VALUES
                     (1, 'n-1', 'calculation.job.'),
                     (2, 'n-2', 'data.dict.');
                 INSERT INTO db_dblog (id, time, loggername, levelname, objpk, objname, message, metadata) VALUES
                     (1, '2018-12-21', 'aiida', 'INFO', 1, 'node.calculation.job.', 'ok',
                      '{\"objpk\": 1, \"objname\": \"node.calculation.job.\", \"extra\": true}'),
                     (2, '2018-12-21', 'aiida', 'INFO', 2, 'node.data.dict.', 'ok', '{}'),
                     (3, '2018-12-21', 'aiida', 'INFO', 7, 'aiida.workflows.user.Legacy', 'wf', '{}'),
                     (4, '2018-12-21', 'aiida', 'INFO', 8, 'calc.mystery', 'odd', '{}'),
                     (5, '2018-12-21', 'aiida', 'WARNING', 99, 'node.gone', 'orphan', '{}');",
            )
            .unwrap();
        harness
    }

    #[test]
    fn registry_is_a_single_line() {
        let registry = registry();
        assert_eq!(registry.base().id(), "1.0.22");
        assert_eq!(registry.head().id(), "1.0.24");
        assert_eq!(registry.line_count(), 1);
        assert!(registry.head().is_reversible());
        assert_eq!(registry.head().destructive_count(revisio::Direction::Forward), 5);
    }

    #[test]
    fn upgrade_exports_and_removes_unmappable_logs() {
        let mut harness = seeded();
        let report = harness.migrate_to("head").unwrap();
        assert_eq!(report.applied_ids(), vec!["1.0.24"]);

        assert_eq!(
            harness.query_all::<i64>("SELECT id FROM db_dblog ORDER BY id").unwrap(),
            vec![1, 2]
        );
        assert_eq!(
            harness
                .query_all::<i64>("SELECT dbnode_id FROM db_dblog ORDER BY id")
                .unwrap(),
            vec![1, 2]
        );
        harness.assert_column_not_exists(LOG_TABLE, "objpk").unwrap();
        harness.assert_column_not_exists(LOG_TABLE, "objname").unwrap();

        let names: Vec<String> = harness
            .sink()
            .writes()
            .iter()
            .map(|(name, _)| name.prefix.clone())
            .collect();
        assert_eq!(
            names[..3],
            [
                "legacy_wf_logs-".to_string(),
                "unknown_entity_logs-".to_string(),
                "no_node_entity_logs-".to_string(),
            ]
        );
        let exported = harness.exported_rows().unwrap();
        assert_eq!(exported[0][0]["objname"], "aiida.workflows.user.Legacy");
        assert_eq!(exported[1][0]["objname"], "calc.mystery");
        assert_eq!(exported[2][0]["message"], "orphan");
        assert_eq!(exported[2][0]["metadata"], "{}");
    }

    #[test]
    fn metadata_loses_duplicated_keys() {
        let mut harness = seeded();
        harness.migrate_to("head").unwrap();
        let metadata: String = harness
            .query_one("SELECT metadata FROM db_dblog WHERE id = 1")
            .unwrap();
        let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(metadata, serde_json::json!({ "extra": true }));
    }

    #[test]
    fn every_log_gets_a_distinct_uuid() {
        let mut harness = seeded();
        harness.migrate_to("head").unwrap();
        let uuids = harness
            .query_all::<String>("SELECT uuid FROM db_dblog ORDER BY id")
            .unwrap();
        assert_eq!(uuids.len(), 2);
        assert_ne!(uuids[0], uuids[1]);
        assert!(uuids.iter().all(|u| uuid::Uuid::parse_str(u).is_ok()));

        // the column is unique now
        let duplicate = harness.execute(&format!(
            "UPDATE db_dblog SET uuid = '{}' WHERE id = 2",
            uuids[0]
        ));
        assert!(duplicate.is_err());
    }

    #[test]
    fn downgrade_restores_columns_but_not_deleted_logs() {
        let mut harness = seeded();
        harness.migrate_to("head").unwrap();
        harness.migrate_to("1.0.23").unwrap();

        harness.assert_column_exists(LOG_TABLE, "objpk").unwrap();
        harness.assert_column_exists(LOG_TABLE, "objname").unwrap();
        harness.assert_column_not_exists(LOG_TABLE, "uuid").unwrap();
        harness.assert_column_not_exists(LOG_TABLE, "dbnode_id").unwrap();
        assert_eq!(
            harness
                .query_all::<String>("SELECT objname FROM db_dblog ORDER BY id")
                .unwrap(),
            vec!["calculation.job.", "data.dict."]
        );
        assert_eq!(
            harness
                .query_all::<i64>("SELECT objpk FROM db_dblog ORDER BY id")
                .unwrap(),
            vec![1, 2]
        );
        let metadata: String = harness
            .query_one("SELECT metadata FROM db_dblog WHERE id = 2")
            .unwrap();
        let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(
            metadata,
            serde_json::json!({ "objpk": 2, "objname": "data.dict." })
        );
        assert_eq!(harness.current().unwrap(), "1.0.23");
    }

    #[test]
    fn clean_database_upgrades_without_exports() {
        let mut harness = TestHarness::interactive(registry(), ScriptedConfirm::default());
        harness.migrate_to("head").unwrap();
        assert!(harness.sink().writes().is_empty());
        assert_eq!(harness.current().unwrap(), "1.0.24");
    }

    #[test]
    fn declining_the_first_export_changes_nothing() {
        let confirm = ScriptedConfirm::new(vec![false]);
        let mut harness = TestHarness::interactive(registry(), confirm.clone());
        harness.migrate_to("1.0.23").unwrap();
        harness
            .execute(
                "INSERT INTO db_dblog (id, time, loggername, levelname, objpk, objname) VALUES
                     (1, '2018-12-21', 'aiida', 'INFO', 7, 'aiida.workflows.user.Legacy');",
            )
            .unwrap();

        let err = harness.migrate_to("head").unwrap_err();
        assert!(matches!(err, Error::UserAborted { rows: 1, .. }));
        assert_eq!(confirm.prompts().len(), 1);
        assert_eq!(harness.current().unwrap(), "1.0.23");
        assert_eq!(
            harness.query_one::<i64>("SELECT COUNT(*) FROM db_dblog").unwrap(),
            1
        );
        harness.assert_column_exists(LOG_TABLE, "objname").unwrap();
    }

    #[test]
    fn to_json_keeps_types() {
        assert_eq!(to_json(&Value::Integer(3)), serde_json::json!(3));
        assert_eq!(to_json(&Value::from("x")), serde_json::json!("x"));
        assert_eq!(to_json(&Value::Null), serde_json::Value::Null);
    }
}
