//! Sample data for development builds.

use rand::seq::SliceRandom;
use rand::Rng;
use schema::{Contact, Groups, OnCallRow, Server, TeamLayout, TeamPosition};
use tracing::info;

use super::{FileManager, MutationError};
use crate::config::BuildMode;
use crate::ratelimit::OperationClass;

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bob", "Carol", "Dan", "Erin", "Frank", "Grace", "Heidi", "Ivan", "Judy", "Mallory",
    "Niaj", "Olivia", "Peggy", "Rupert", "Sybil", "Trent", "Victor", "Walter",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Jones", "Garcia", "Miller", "Davis", "Lopez", "Wilson", "Anderson", "Thomas",
    "Moore", "Martin", "Lee", "Walker", "Young",
];

const TITLES: &[&str] = &[
    "Site Reliability Engineer",
    "Database Administrator",
    "Network Engineer",
    "Service Desk Analyst",
    "Platform Lead",
];

const TEAMS: &[&str] = &["Ops", "DBA", "Network", "Service Desk", "Security"];

const ROLES: &[&str] = &["Primary", "Secondary", "Escalation"];

const BUSINESS_AREAS: &[&str] = &["Retail", "Finance", "Logistics", "Corporate"];

const OPERATING_SYSTEMS: &[(&str, &str)] = &[
    ("Windows", "Windows Server 2022"),
    ("Windows", "Windows Server 2019"),
    ("Linux", "Ubuntu 22.04"),
    ("Linux", "RHEL 9"),
];

/// A full set of generated collections.
#[derive(Debug, Clone, Default)]
pub(crate) struct DummyData {
    pub contacts: Vec<Contact>,
    pub servers: Vec<Server>,
    pub on_call: Vec<OnCallRow>,
    pub groups: Groups,
    pub team_layout: TeamLayout,
}

fn pick<'a, R: Rng>(rng: &mut R, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

/// Generate `count` contacts and servers plus a rota, groups and layout
/// built from them.
pub(crate) fn generate<R: Rng>(rng: &mut R, count: usize) -> DummyData {
    let contacts: Vec<Contact> = (0..count)
        .map(|i| {
            let first = pick(rng, FIRST_NAMES);
            let last = pick(rng, LAST_NAMES);
            Contact::new(
                format!("{first} {last}"),
                format!("{}.{}{}@example.com", first.to_lowercase(), last.to_lowercase(), i),
            )
            .with_phone(format!("+1 555 {:04}", rng.gen_range(0..10_000)))
            .with_title(pick(rng, TITLES))
        })
        .collect();

    let servers: Vec<Server> = (0..count)
        .map(|i| {
            let (os_type, os) = OPERATING_SYSTEMS
                .choose(rng)
                .copied()
                .unwrap_or(("Linux", "Ubuntu 22.04"));
            let owner = contacts
                .choose(rng)
                .map(|c| c.email.clone())
                .unwrap_or_default();
            Server {
                name: format!("SRV-{:04}", i + 1),
                business_area: pick(rng, BUSINESS_AREAS).to_string(),
                lob: format!("LOB-{}", rng.gen_range(1..=9)),
                comment: String::new(),
                contact: owner.clone(),
                owner,
                os_type: os_type.to_string(),
                os: os.to_string(),
            }
        })
        .collect();

    let mut on_call = Vec::new();
    let mut team_layout = TeamLayout::new();
    for (index, team) in TEAMS.iter().enumerate() {
        for role in ROLES {
            let person = contacts.choose(rng);
            let mut row = OnCallRow::new(
                uuid::Uuid::new_v4().to_string(),
                *team,
                *role,
                person.map(|c| c.name.clone()).unwrap_or_default(),
            );
            row.contact = person.map(|c| c.phone.clone()).unwrap_or_default();
            on_call.push(row);
        }
        let column = (index % 3) as f64;
        let line = (index / 3) as f64;
        team_layout.insert(team.to_string(), TeamPosition::new(column * 320.0, line * 240.0));
    }

    let mut groups = Groups::new();
    for title in TITLES {
        let members: Vec<String> = contacts
            .iter()
            .filter(|c| c.title == *title)
            .map(|c| c.email.clone())
            .collect();
        if !members.is_empty() {
            groups.insert(title.to_string(), members);
        }
    }

    DummyData {
        contacts,
        servers,
        on_call,
        groups,
        team_layout,
    }
}

impl FileManager {
    /// Replace every collection with generated sample data.
    ///
    /// Refused outside development mode, and always in release builds.
    pub async fn generate_dummy_data(&self, count: usize) -> Result<(), MutationError> {
        if self.ctx.mode.clamp_to_build() != BuildMode::Development {
            return Err(MutationError::EnvironmentGuard {
                operation: "generate_dummy_data",
            });
        }
        self.admit(OperationClass::Mutation)?;

        let data = generate(&mut rand::thread_rng(), count);

        self.run(
            "generate_dummy_data",
            |_: &Vec<Contact>| Ok(()),
            |_| data.contacts.clone(),
        )
        .await?;
        self.run(
            "generate_dummy_data",
            |_: &Vec<Server>| Ok(()),
            |_| data.servers.clone(),
        )
        .await?;
        self.run(
            "generate_dummy_data",
            |_: &Vec<OnCallRow>| Ok(()),
            |_| data.on_call.clone(),
        )
        .await?;
        self.run(
            "generate_dummy_data",
            |_: &Groups| Ok(()),
            |_| data.groups.clone(),
        )
        .await?;
        self.run(
            "generate_dummy_data",
            |_: &TeamLayout| Ok(()),
            |_| data.team_layout.clone(),
        )
        .await?;

        info!(count, "Generated dummy data");
        Ok(())
    }
}
