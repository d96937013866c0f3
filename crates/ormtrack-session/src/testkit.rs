//! Shared entity fixtures for this crate's tests.
//!
//! A small org-chart schema: departments own employees (client-cascade),
//! employees manage other employees (set-null) and hold badges (restrict),
//! projects own tasks (cascade) and relate to employees through a join
//! entity.

use ormtrack_core::{
    DeleteBehavior, Entity, Error, JoinTableInfo, PropertyInfo, Record, RelationshipInfo, Result,
    Value, require_value,
};

fn opt_i64(record: &Record, name: &str) -> Result<Option<i64>> {
    match require_value(record, name)? {
        Value::Null => Ok(None),
        v => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::Custom(format!("property '{name}' is not an integer"))),
    }
}

fn req_i64(record: &Record, name: &str) -> Result<i64> {
    opt_i64(record, name)?
        .ok_or_else(|| Error::Custom(format!("property '{name}' is unexpectedly NULL")))
}

fn req_text(record: &Record, name: &str) -> Result<String> {
    require_value(record, name)?
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| Error::Custom(format!("property '{name}' is not text")))
}

fn text(value: &Value, name: &str) -> Result<String> {
    value
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| Error::Custom(format!("property '{name}' is not text")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Department {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Department {
    const ENTITY_NAME: &'static str = "departments";
    const KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] =
        &[RelationshipInfo::one_to_many("members", "employees", "department_id")
            .on_delete(DeleteBehavior::ClientCascade)];

    fn properties() -> &'static [PropertyInfo] {
        static PROPS: [PropertyInfo; 2] = [
            PropertyInfo::new("id").key(true).auto_generated(true),
            PropertyInfo::new("name"),
        ];
        &PROPS
    }

    fn to_record(&self) -> Record {
        Record::new(vec![
            ("id", Value::from(self.id)),
            ("name", Value::from(self.name.clone())),
        ])
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: opt_i64(record, "id")?,
            name: req_text(record, "name")?,
        })
    }

    fn write_property(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = value.as_i64(),
            "name" => self.name = text(&value, name)?,
            _ => return Err(Error::Custom(format!("unknown property '{name}'"))),
        }
        Ok(())
    }

    fn key_value(&self) -> Vec<Value> {
        vec![Value::from(self.id)]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Employee {
    pub id: Option<i64>,
    pub name: String,
    pub salary: i64,
    pub department_id: Option<i64>,
    pub manager_id: Option<i64>,
}

impl Entity for Employee {
    const ENTITY_NAME: &'static str = "employees";
    const KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[
        RelationshipInfo::one_to_many("reports", "employees", "manager_id")
            .on_delete(DeleteBehavior::SetNull),
        RelationshipInfo::one_to_many("badges", "badges", "employee_id"),
        RelationshipInfo::many_to_many(
            "projects",
            "projects",
            JoinTableInfo {
                name: "project_members",
                self_key: "employee_id",
                related_key: "project_id",
            },
        ),
    ];

    fn properties() -> &'static [PropertyInfo] {
        static PROPS: [PropertyInfo; 5] = [
            PropertyInfo::new("id").key(true).auto_generated(true),
            PropertyInfo::new("name"),
            PropertyInfo::new("salary"),
            PropertyInfo::new("department_id")
                .nullable(true)
                .foreign_key("departments.id")
                .on_delete(DeleteBehavior::ClientCascade),
            PropertyInfo::new("manager_id")
                .nullable(true)
                .foreign_key("employees.id")
                .on_delete(DeleteBehavior::SetNull),
        ];
        &PROPS
    }

    fn to_record(&self) -> Record {
        Record::new(vec![
            ("id", Value::from(self.id)),
            ("name", Value::from(self.name.clone())),
            ("salary", Value::BigInt(self.salary)),
            ("department_id", Value::from(self.department_id)),
            ("manager_id", Value::from(self.manager_id)),
        ])
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: opt_i64(record, "id")?,
            name: req_text(record, "name")?,
            salary: req_i64(record, "salary")?,
            department_id: opt_i64(record, "department_id")?,
            manager_id: opt_i64(record, "manager_id")?,
        })
    }

    fn write_property(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = value.as_i64(),
            "name" => self.name = text(&value, name)?,
            "salary" => {
                self.salary = value
                    .as_i64()
                    .ok_or_else(|| Error::Custom("salary is not an integer".into()))?;
            }
            "department_id" => self.department_id = value.as_i64(),
            "manager_id" => self.manager_id = value.as_i64(),
            _ => return Err(Error::Custom(format!("unknown property '{name}'"))),
        }
        Ok(())
    }

    fn key_value(&self) -> Vec<Value> {
        vec![Value::from(self.id)]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Project {
    const ENTITY_NAME: &'static str = "projects";
    const KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[
        RelationshipInfo::one_to_many("tasks", "tasks", "project_id")
            .on_delete(DeleteBehavior::Cascade),
        RelationshipInfo::many_to_many(
            "members",
            "employees",
            JoinTableInfo {
                name: "project_members",
                self_key: "project_id",
                related_key: "employee_id",
            },
        ),
    ];

    fn properties() -> &'static [PropertyInfo] {
        static PROPS: [PropertyInfo; 2] = [
            PropertyInfo::new("id").key(true).auto_generated(true),
            PropertyInfo::new("name"),
        ];
        &PROPS
    }

    fn to_record(&self) -> Record {
        Record::new(vec![
            ("id", Value::from(self.id)),
            ("name", Value::from(self.name.clone())),
        ])
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: opt_i64(record, "id")?,
            name: req_text(record, "name")?,
        })
    }

    fn write_property(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = value.as_i64(),
            "name" => self.name = text(&value, name)?,
            _ => return Err(Error::Custom(format!("unknown property '{name}'"))),
        }
        Ok(())
    }

    fn key_value(&self) -> Vec<Value> {
        vec![Value::from(self.id)]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: Option<i64>,
    pub title: String,
    pub project_id: i64,
}

impl Entity for Task {
    const ENTITY_NAME: &'static str = "tasks";
    const KEY: &'static [&'static str] = &["id"];

    fn properties() -> &'static [PropertyInfo] {
        static PROPS: [PropertyInfo; 3] = [
            PropertyInfo::new("id").key(true).auto_generated(true),
            PropertyInfo::new("title"),
            PropertyInfo::new("project_id")
                .foreign_key("projects.id")
                .on_delete(DeleteBehavior::Cascade),
        ];
        &PROPS
    }

    fn to_record(&self) -> Record {
        Record::new(vec![
            ("id", Value::from(self.id)),
            ("title", Value::from(self.title.clone())),
            ("project_id", Value::BigInt(self.project_id)),
        ])
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: opt_i64(record, "id")?,
            title: req_text(record, "title")?,
            project_id: req_i64(record, "project_id")?,
        })
    }

    fn write_property(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = value.as_i64(),
            "title" => self.title = text(&value, name)?,
            "project_id" => {
                self.project_id = value
                    .as_i64()
                    .ok_or_else(|| Error::Custom("project_id is not an integer".into()))?;
            }
            _ => return Err(Error::Custom(format!("unknown property '{name}'"))),
        }
        Ok(())
    }

    fn key_value(&self) -> Vec<Value> {
        vec![Value::from(self.id)]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Badge {
    pub id: Option<i64>,
    pub code: String,
    pub employee_id: i64,
}

impl Entity for Badge {
    const ENTITY_NAME: &'static str = "badges";
    const KEY: &'static [&'static str] = &["id"];

    fn properties() -> &'static [PropertyInfo] {
        static PROPS: [PropertyInfo; 3] = [
            PropertyInfo::new("id").key(true).auto_generated(true),
            PropertyInfo::new("code"),
            PropertyInfo::new("employee_id").foreign_key("employees.id"),
        ];
        &PROPS
    }

    fn to_record(&self) -> Record {
        Record::new(vec![
            ("id", Value::from(self.id)),
            ("code", Value::from(self.code.clone())),
            ("employee_id", Value::BigInt(self.employee_id)),
        ])
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: opt_i64(record, "id")?,
            code: req_text(record, "code")?,
            employee_id: req_i64(record, "employee_id")?,
        })
    }

    fn write_property(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = value.as_i64(),
            "code" => self.code = text(&value, name)?,
            "employee_id" => {
                self.employee_id = value
                    .as_i64()
                    .ok_or_else(|| Error::Custom("employee_id is not an integer".into()))?;
            }
            _ => return Err(Error::Custom(format!("unknown property '{name}'"))),
        }
        Ok(())
    }

    fn key_value(&self) -> Vec<Value> {
        vec![Value::from(self.id)]
    }

    fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

pub fn employee(id: Option<i64>, name: &str, salary: i64, manager_id: Option<i64>) -> Employee {
    Employee {
        id,
        name: name.to_string(),
        salary,
        department_id: None,
        manager_id,
    }
}

pub fn department(id: Option<i64>, name: &str) -> Department {
    Department {
        id,
        name: name.to_string(),
    }
}

pub fn project(id: Option<i64>, name: &str) -> Project {
    Project {
        id,
        name: name.to_string(),
    }
}

pub fn task(id: Option<i64>, title: &str, project_id: i64) -> Task {
    Task {
        id,
        title: title.to_string(),
        project_id,
    }
}

pub fn badge(id: Option<i64>, code: &str, employee_id: i64) -> Badge {
    Badge {
        id,
        code: code.to_string(),
        employee_id,
    }
}

/// A store for tests that never reach the persistence port.
///
/// Reads find nothing; writes are a test bug and fail loudly.
pub struct NullStore;

pub struct NullTx;

impl crate::Store for NullStore {
    type Tx<'s> = NullTx;

    async fn fetch_by_key(
        &self,
        _cx: &asupersync::Cx,
        _entity: &'static str,
        _key: &[Value],
    ) -> asupersync::Outcome<Option<Record>, Error> {
        asupersync::Outcome::Ok(None)
    }

    async fn fetch_by_property(
        &self,
        _cx: &asupersync::Cx,
        _entity: &'static str,
        _property: &'static str,
        _value: &Value,
    ) -> asupersync::Outcome<Vec<Record>, Error> {
        asupersync::Outcome::Ok(Vec::new())
    }

    async fn fetch_current_values(
        &self,
        _cx: &asupersync::Cx,
        _entity: &'static str,
        _key: &[Value],
    ) -> asupersync::Outcome<Option<Record>, Error> {
        asupersync::Outcome::Ok(None)
    }

    async fn begin(&self, _cx: &asupersync::Cx) -> asupersync::Outcome<NullTx, Error> {
        asupersync::Outcome::Ok(NullTx)
    }
}

impl ormtrack_core::StoreTransaction for NullTx {
    async fn insert(
        &mut self,
        _cx: &asupersync::Cx,
        entity: &'static str,
        _record: &Record,
    ) -> asupersync::Outcome<Vec<Value>, Error> {
        asupersync::Outcome::Err(Error::Custom(format!("unexpected insert into '{entity}'")))
    }

    async fn update(
        &mut self,
        _cx: &asupersync::Cx,
        entity: &'static str,
        _key: &[Value],
        _changes: &[(&'static str, Value)],
        _expected: &[(&'static str, Value)],
    ) -> asupersync::Outcome<u64, Error> {
        asupersync::Outcome::Err(Error::Custom(format!("unexpected update of '{entity}'")))
    }

    async fn delete(
        &mut self,
        _cx: &asupersync::Cx,
        entity: &'static str,
        _key: &[Value],
        _expected: &[(&'static str, Value)],
    ) -> asupersync::Outcome<u64, Error> {
        asupersync::Outcome::Err(Error::Custom(format!("unexpected delete of '{entity}'")))
    }

    async fn link(
        &mut self,
        _cx: &asupersync::Cx,
        join_entity: &'static str,
        _left: (&'static str, Value),
        _right: (&'static str, Value),
    ) -> asupersync::Outcome<(), Error> {
        asupersync::Outcome::Err(Error::Custom(format!("unexpected link in '{join_entity}'")))
    }

    async fn unlink(
        &mut self,
        _cx: &asupersync::Cx,
        join_entity: &'static str,
        _left: (&'static str, Value),
        _right: (&'static str, Value),
    ) -> asupersync::Outcome<(), Error> {
        asupersync::Outcome::Err(Error::Custom(format!("unexpected unlink in '{join_entity}'")))
    }

    async fn commit(self, _cx: &asupersync::Cx) -> asupersync::Outcome<(), Error> {
        asupersync::Outcome::Ok(())
    }

    async fn rollback(self, _cx: &asupersync::Cx) -> asupersync::Outcome<(), Error> {
        asupersync::Outcome::Ok(())
    }
}
