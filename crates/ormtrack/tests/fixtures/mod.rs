//! Shared org-chart fixtures for the integration tests.

use ormtrack::prelude::*;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn opt_i64(record: &Record, name: &str) -> Result<Option<i64>> {
    match require_value(record, name)? {
        Value::Null => Ok(None),
        v => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::Custom(format!("property '{name}' is not an integer"))),
    }
}

fn req_text(record: &Record, name: &str) -> Result<String> {
    require_value(record, name)?
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
            "name" => self.name = value.as_str().unwrap_or_default().to_string(),
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
            salary: require_value(record, "salary")?
                .as_i64()
                .ok_or_else(|| Error::Custom("salary is not an integer".into()))?,
            department_id: opt_i64(record, "department_id")?,
            manager_id: opt_i64(record, "manager_id")?,
        })
    }

    fn write_property(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "id" => self.id = value.as_i64(),
            "name" => self.name = value.as_str().unwrap_or_default().to_string(),
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
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[RelationshipInfo::many_to_many(
        "members",
        "employees",
        JoinTableInfo {
            name: "project_members",
            self_key: "project_id",
            related_key: "employee_id",
        },
    )];

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
            "name" => self.name = value.as_str().unwrap_or_default().to_string(),
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

pub fn employee(id: Option<i64>, name: &str, salary: i64) -> Employee {
    Employee {
        id,
        name: name.to_string(),
        salary,
        department_id: None,
        manager_id: None,
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

/// A store with the whole org-chart schema registered.
pub fn org_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.register::<Department>();
    store.register::<Employee>();
    store.register::<Project>();
    store
}

/// A session over [`org_store`] with every fixture type registered.
pub fn org_session(store: MemoryStore) -> Session<MemoryStore> {
    let mut session = Session::new(store);
    session.register::<Department>();
    session.register::<Employee>();
    session.register::<Project>();
    session
}
