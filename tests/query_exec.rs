use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use elemental::{
    Config, Connections, Context, Error, Field, FieldType, MemoryStore, Model, ObjectId, Schema,
    SchemaOptions, Scheduler, SortOrder,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Character {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    name: String,
    age: i64,
    occupation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    school: Option<String>,
}

fn character(name: &str, age: i64, occupation: &str, school: Option<&str>) -> Character {
    Character {
        id: None,
        name: name.into(),
        age,
        occupation: occupation.into(),
        school: school.map(str::to_string),
    }
}

fn seeded() -> Model<Character> {
    let connections = Connections::with_default(Config::default(), Arc::new(MemoryStore::new()));
    let schema = Schema::new(
        [("name", Field::new(FieldType::String).unique())],
        SchemaOptions::default(),
    )
    .with_default_timestamps();
    let model = Model::new("Character", schema, &connections).unwrap();
    model
        .insert_many([
            character("Geralt", 100, "Witcher", Some("Wolf")),
            character("Yennefer", 100, "Mage", None),
            character("Vesemir", 300, "Witcher", Some("Wolf")),
            character("Ciri", 21, "Witcher", Some("Wolf")),
            character("Gaetan", 60, "Witcher", Some("Cat")),
            character("Eredin", 500, "King", None),
        ])
        .unwrap();
    model
}

fn names(rows: &[Character]) -> Vec<&str> {
    rows.iter().map(|c| c.name.as_str()).collect()
}

#[test]
fn range_on_one_field_is_conjoined() {
    let model = seeded();
    let rows = model
        .where_field("age")
        .greater_than(50)
        .less_than(200)
        .sort_by("name", SortOrder::Asc)
        .exec()
        .unwrap();
    assert_eq!(names(&rows), vec!["Gaetan", "Geralt", "Yennefer"]);
}

#[test]
fn filter_then_operators_then_sort_and_limit() {
    let model = seeded();
    let rows = model
        .find(json!({"occupation": "Witcher"}))
        .where_field("age")
        .greater_than_or_equals(60)
        .sort(vec![json!("age"), json!("desc")])
        .unwrap()
        .limit(2)
        .exec()
        .unwrap();
    assert_eq!(names(&rows), vec!["Vesemir", "Geralt"]);
}

#[test]
fn or_where_widens_the_match() {
    let model = seeded();
    let rows = model
        .where_field("age")
        .greater_than(250)
        .or_where_equals("occupation", "Mage")
        .sort_by("name", SortOrder::Asc)
        .exec()
        .unwrap();
    assert_eq!(names(&rows), vec!["Eredin", "Vesemir", "Yennefer"]);
}

#[test]
fn set_and_existence_operators() {
    let model = seeded();
    let rows = model
        .where_field("school")
        .exists(true)
        .where_field("name")
        .not_in(["Ciri"])
        .matches_regex("^G")
        .sort_by("age", SortOrder::Desc)
        .exec()
        .unwrap();
    assert_eq!(names(&rows), vec!["Geralt", "Gaetan"]);

    let mages = model.where_field("occupation").is_in(["Mage", "King"]).exec().unwrap();
    assert_eq!(mages.len(), 2);
}

#[test]
fn projection_excludes_fields() {
    let model = seeded();
    let rows = model
        .query()
        .where_equals("name", "Ciri")
        .select("-_id -created_at -updated_at")
        .exec()
        .unwrap();
    assert_eq!(rows, vec![character("Ciri", 21, "Witcher", Some("Wolf"))]);
}

#[test]
fn find_one_and_find_by_id() {
    let model = seeded();
    let ciri = model
        .find_one(json!({"name": "Ciri"}))
        .exec()
        .unwrap()
        .unwrap();
    let id = ciri.id.unwrap();
    assert_eq!(model.find_by_id(id).exec().unwrap(), Some(ciri));
    assert_eq!(model.find_by_id(ObjectId::new()).exec().unwrap(), None);
}

#[test]
fn or_fail_raises_on_empty_results() {
    let model = seeded();
    let err = model
        .find_one(json!({"name": "Dettlaff"}))
        .or_fail()
        .exec()
        .unwrap_err();
    assert!(matches!(err, Error::NoResults));
    assert_eq!(err.to_string(), "no results found matching the given query");

    let err = model
        .where_field("age")
        .greater_than(1000)
        .or_fail_with(|| Error::Custom("nobody that old".into()))
        .exec()
        .unwrap_err();
    assert_eq!(err.to_string(), "nobody that old");

    let found = model.find(json!({"name": "Geralt"})).or_fail().exec().unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn count_documents() {
    let model = seeded();
    assert_eq!(model.count_documents(json!({"occupation": "Witcher"})).exec().unwrap(), 4);
    assert_eq!(model.count_documents(json!({})).exec().unwrap(), 6);
    assert_eq!(model.count_documents(json!({"occupation": "Bard"})).exec().unwrap(), 0);
}

#[test]
fn distinct_values_in_first_seen_order() {
    let model = seeded();
    let schools = model
        .distinct("school", json!({"occupation": "Witcher"}))
        .exec()
        .unwrap();
    assert_eq!(schools, vec![json!("Wolf"), json!("Cat")]);
}

#[test]
fn operator_without_field_fails_before_running() {
    let model = seeded();
    let err = model.query().equals("Geralt").exec().unwrap_err();
    assert!(matches!(err, Error::MissingTargetField(op) if op == "$eq"));
}

#[test]
fn timestamps_are_stored() {
    let model = seeded();
    let raw = model
        .collection()
        .aggregate(&[json!({"$match": {"name": "Geralt"}})], &Context::background())
        .unwrap();
    assert!(raw[0]["created_at"].is_string());
    assert!(raw[0]["updated_at"].is_string());
}

#[test]
fn cancelled_and_expired_contexts_abort() {
    let model = seeded();
    let ctx = Context::background();
    ctx.cancel();
    assert!(matches!(
        model.query().exec_with(&ctx),
        Err(Error::Cancelled)
    ));

    let expired = Context::with_deadline(Instant::now() - Duration::from_millis(1));
    assert!(matches!(
        model.count_documents(json!({})).exec_with(&expired),
        Err(Error::DeadlineExceeded)
    ));
}

#[test]
fn scheduled_query_runs_on_each_firing() {
    let model = seeded();
    let scheduler = Scheduler::new(Duration::from_secs(3600));
    let fired = Arc::new(AtomicUsize::new(0));

    let job = model
        .count_documents(json!({}))
        .schedule("* * * * *")
        .exec(&scheduler)
        .unwrap();
    let counter = Arc::clone(&fired);
    scheduler
        .add("* * * * *", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    assert_eq!(scheduler.run_due(Utc::now()), 2);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let info = scheduler.jobs().into_iter().find(|j| j.id == job).unwrap();
    assert_eq!(info.run_count, 1);
}

#[test]
fn bad_schedule_expression_fails_immediately() {
    let model = seeded();
    let scheduler = Scheduler::default();
    let err = model
        .query()
        .schedule("whenever")
        .exec(&scheduler)
        .unwrap_err();
    assert!(matches!(err, Error::Schedule(_)));
    assert!(scheduler.is_empty());
}
