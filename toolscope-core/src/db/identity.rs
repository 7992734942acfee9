//! People, teams, orgs, operator accounts, remember tokens and settings
//!
//! Operator accounts (`users`) are unrelated to telemetry user ids; they
//! authenticate against argon2 hashes. Remember tokens are stored only as
//! SHA-256 digests — the plaintext leaves this module exactly once, at
//! issue time.

use super::{Database, Sql, SqlRow};
use crate::error::{Error, Result};
use crate::sql_params;
use crate::types::{
    LoginAudit, Org, OrgPatch, Person, PersonUsername, RememberToken, Role, Setting, SystemUser,
    Team,
};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Issued remember tokens default to a 30-day lifetime.
pub const DEFAULT_TOKEN_TTL_DAYS: i64 = 30;

// ============================================
// Password and token hashing
// ============================================

pub(crate) fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Config(format!("password hashing failed: {}", e)))
}

pub(crate) fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::password_hash::PasswordHash;
    use argon2::{Argon2, PasswordVerifier};

    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

// ============================================
// People
// ============================================

const INSERT_PERSON: Sql = Sql {
    sqlite: "INSERT INTO people (display_name, email, initials) VALUES (?1, ?2, ?3) RETURNING id",
    postgres: "INSERT INTO people (display_name, email, initials) VALUES ($1, $2, $3) RETURNING id",
};

const GET_PERSON: Sql = Sql {
    sqlite: "SELECT id, display_name, email, initials FROM people WHERE id = ?1",
    postgres: "SELECT id, display_name, email, initials FROM people WHERE id = $1",
};

const UPDATE_PERSON: Sql = Sql {
    sqlite: "UPDATE people SET display_name = ?2, email = ?3, initials = ?4 WHERE id = ?1",
    postgres: "UPDATE people SET display_name = $2, email = $3, initials = $4 WHERE id = $1",
};

const DELETE_PERSON: Sql = Sql {
    sqlite: "DELETE FROM people WHERE id = ?1",
    postgres: "DELETE FROM people WHERE id = $1",
};

const INSERT_PERSON_USERNAME: Sql = Sql {
    sqlite: "INSERT INTO people_usernames (person_id, username, org_id) VALUES (?1, ?2, ?3) RETURNING id",
    postgres: "INSERT INTO people_usernames (person_id, username, org_id) VALUES ($1, $2, $3) RETURNING id",
};

const DELETE_PERSON_USERNAME: Sql = Sql {
    sqlite: "DELETE FROM people_usernames WHERE person_id = ?1 AND username = ?2",
    postgres: "DELETE FROM people_usernames WHERE person_id = $1 AND username = $2",
};

const LIST_PERSON_USERNAMES: Sql = Sql {
    sqlite: "SELECT id, person_id, username, org_id FROM people_usernames
             WHERE person_id = ?1 ORDER BY username",
    postgres: "SELECT id, person_id, username, org_id FROM people_usernames
               WHERE person_id = $1 ORDER BY username",
};

fn row_to_person(row: &SqlRow) -> Result<Person> {
    Ok(Person {
        id: row.get_i64("id")?,
        display_name: row.get_str("display_name")?,
        email: row.get_opt_str("email")?,
        initials: row.get_opt_str("initials")?,
    })
}

impl Database {
    pub fn create_person(
        &self,
        display_name: &str,
        email: Option<&str>,
        initials: Option<&str>,
    ) -> Result<i64> {
        self.insert(
            &INSERT_PERSON,
            &sql_params![
                display_name,
                email.map(str::to_string),
                initials.map(str::to_string)
            ],
        )
    }

    pub fn get_person(&self, id: i64) -> Result<Option<Person>> {
        self.query_one(&GET_PERSON, &sql_params![id])?
            .map(|row| row_to_person(&row))
            .transpose()
    }

    pub fn list_people(&self) -> Result<Vec<Person>> {
        let rows = self.query(
            &Sql::same("SELECT id, display_name, email, initials FROM people ORDER BY display_name"),
            &[],
        )?;
        rows.iter().map(row_to_person).collect()
    }

    pub fn update_person(
        &self,
        id: i64,
        display_name: &str,
        email: Option<&str>,
        initials: Option<&str>,
    ) -> Result<bool> {
        let affected = self.execute(
            &UPDATE_PERSON,
            &sql_params![
                id,
                display_name,
                email.map(str::to_string),
                initials.map(str::to_string)
            ],
        )?;
        Ok(affected > 0)
    }

    /// Delete a person; owned usernames cascade.
    pub fn delete_person(&self, id: i64) -> Result<bool> {
        let affected = self.execute(&DELETE_PERSON, &sql_params![id])?;
        Ok(affected > 0)
    }

    /// Attach a telemetry username to a person. Unique on
    /// `(person_id, username)`; duplicates surface as `Conflict`.
    pub fn add_username_to_person(
        &self,
        person_id: i64,
        username: &str,
        org_id: Option<&str>,
    ) -> Result<i64> {
        self.insert(
            &INSERT_PERSON_USERNAME,
            &sql_params![person_id, username, org_id.map(str::to_string)],
        )
    }

    pub fn remove_username_from_person(&self, person_id: i64, username: &str) -> Result<bool> {
        let affected = self.execute(&DELETE_PERSON_USERNAME, &sql_params![person_id, username])?;
        Ok(affected > 0)
    }

    pub fn get_person_usernames(&self, person_id: i64) -> Result<Vec<PersonUsername>> {
        let rows = self.query(&LIST_PERSON_USERNAMES, &sql_params![person_id])?;
        rows.iter()
            .map(|row| {
                Ok(PersonUsername {
                    id: row.get_i64("id")?,
                    person_id: row.get_i64("person_id")?,
                    username: row.get_str("username")?,
                    org_id: row.get_opt_str("org_id")?,
                })
            })
            .collect()
    }
}

// ============================================
// Teams
// ============================================

const INSERT_TEAM: Sql = Sql {
    sqlite: "INSERT INTO teams (name, color, logo_data, logo_mime) VALUES (?1, ?2, ?3, ?4) RETURNING id",
    postgres: "INSERT INTO teams (name, color, logo_data, logo_mime) VALUES ($1, $2, $3, $4) RETURNING id",
};

const GET_TEAM: Sql = Sql {
    sqlite: "SELECT id, name, color, logo_data, logo_mime FROM teams WHERE id = ?1",
    postgres: "SELECT id, name, color, logo_data, logo_mime FROM teams WHERE id = $1",
};

const GET_TEAM_BY_NAME: Sql = Sql {
    sqlite: "SELECT id, name, color, logo_data, logo_mime FROM teams WHERE name = ?1",
    postgres: "SELECT id, name, color, logo_data, logo_mime FROM teams WHERE name = $1",
};

const UPDATE_TEAM: Sql = Sql {
    sqlite: "UPDATE teams SET name = ?2, color = ?3 WHERE id = ?1",
    postgres: "UPDATE teams SET name = $2, color = $3 WHERE id = $1",
};

const SET_TEAM_LOGO: Sql = Sql {
    sqlite: "UPDATE teams SET logo_data = ?2, logo_mime = ?3 WHERE id = ?1",
    postgres: "UPDATE teams SET logo_data = $2, logo_mime = $3 WHERE id = $1",
};

fn row_to_team(row: &SqlRow) -> Result<Team> {
    Ok(Team {
        id: row.get_i64("id")?,
        name: row.get_str("name")?,
        color: row.get_opt_str("color")?,
        logo_data: row.get_opt_bytes("logo_data")?,
        logo_mime: row.get_opt_str("logo_mime")?,
    })
}

impl Database {
    /// Create a team. Names are unique (case-sensitively); duplicates
    /// surface as `Conflict`.
    pub fn create_team(
        &self,
        name: &str,
        color: Option<&str>,
        logo_data: Option<&[u8]>,
        logo_mime: Option<&str>,
    ) -> Result<i64> {
        self.insert(
            &INSERT_TEAM,
            &sql_params![
                name,
                color.map(str::to_string),
                logo_data.map(|b| b.to_vec()),
                logo_mime.map(str::to_string)
            ],
        )
    }

    pub fn get_team(&self, id: i64) -> Result<Option<Team>> {
        self.query_one(&GET_TEAM, &sql_params![id])?
            .map(|row| row_to_team(&row))
            .transpose()
    }

    pub fn get_team_by_name(&self, name: &str) -> Result<Option<Team>> {
        self.query_one(&GET_TEAM_BY_NAME, &sql_params![name])?
            .map(|row| row_to_team(&row))
            .transpose()
    }

    pub fn list_teams(&self) -> Result<Vec<Team>> {
        let rows = self.query(
            &Sql::same("SELECT id, name, color, logo_data, logo_mime FROM teams ORDER BY name"),
            &[],
        )?;
        rows.iter().map(row_to_team).collect()
    }

    pub fn update_team(&self, id: i64, name: &str, color: Option<&str>) -> Result<bool> {
        let affected = self.execute(
            &UPDATE_TEAM,
            &sql_params![id, name, color.map(str::to_string)],
        )?;
        Ok(affected > 0)
    }

    /// Replace the team's binary logo atomically.
    pub fn set_team_logo(&self, id: i64, logo_data: &[u8], logo_mime: &str) -> Result<bool> {
        let affected = self.execute(&SET_TEAM_LOGO, &sql_params![id, logo_data, logo_mime])?;
        Ok(affected > 0)
    }

    /// Delete a team, nulling out references in orgs and user-team
    /// assignments. Event rows keep their historical snapshot.
    pub fn delete_team(&self, id: i64) -> Result<bool> {
        let mut tx = self.transaction()?;
        let (null_orgs, null_users, delete) = match self.kind() {
            super::BackendKind::Sqlite => (
                "UPDATE orgs SET team_id = NULL WHERE team_id = ?1",
                "UPDATE event_user_teams SET team_id = NULL WHERE team_id = ?1",
                "DELETE FROM teams WHERE id = ?1",
            ),
            super::BackendKind::Postgres => (
                "UPDATE orgs SET team_id = NULL WHERE team_id = $1",
                "UPDATE event_user_teams SET team_id = NULL WHERE team_id = $1",
                "DELETE FROM teams WHERE id = $1",
            ),
        };
        tx.execute(null_orgs, &sql_params![id])?;
        tx.execute(null_users, &sql_params![id])?;
        let affected = tx.execute(delete, &sql_params![id])?;
        tx.commit()?;
        Ok(affected > 0)
    }
}

// ============================================
// Orgs
// ============================================

const UPSERT_ORG: Sql = Sql {
    sqlite: "INSERT INTO orgs (server_id, company_name, alias, color, team_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(server_id) DO UPDATE SET
                 company_name = COALESCE(excluded.company_name, orgs.company_name),
                 alias = COALESCE(excluded.alias, orgs.alias),
                 color = COALESCE(excluded.color, orgs.color),
                 team_id = COALESCE(excluded.team_id, orgs.team_id)",
    postgres: "INSERT INTO orgs (server_id, company_name, alias, color, team_id)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (server_id) DO UPDATE SET
                   company_name = COALESCE(excluded.company_name, orgs.company_name),
                   alias = COALESCE(excluded.alias, orgs.alias),
                   color = COALESCE(excluded.color, orgs.color),
                   team_id = COALESCE(excluded.team_id, orgs.team_id)",
};

const GET_ORG: Sql = Sql {
    sqlite: "SELECT server_id, company_name, alias, color, team_id FROM orgs WHERE server_id = ?1",
    postgres: "SELECT server_id, company_name, alias, color, team_id FROM orgs WHERE server_id = $1",
};

const MOVE_ORG_TO_TEAM: Sql = Sql {
    sqlite: "UPDATE orgs SET team_id = ?2 WHERE server_id = ?1",
    postgres: "UPDATE orgs SET team_id = $2 WHERE server_id = $1",
};

const RECALCULATE_EVENT_TEAMS: Sql = Sql {
    sqlite: "UPDATE telemetry_events
             SET team_id = (SELECT team_id FROM orgs WHERE server_id = ?1)
             WHERE COALESCE(org_id, server_id) = ?1",
    postgres: "UPDATE telemetry_events
               SET team_id = (SELECT team_id FROM orgs WHERE server_id = $1)
               WHERE COALESCE(org_id, server_id) = $1",
};

fn row_to_org(row: &SqlRow) -> Result<Org> {
    Ok(Org {
        server_id: row.get_str("server_id")?,
        company_name: row.get_opt_str("company_name")?,
        alias: row.get_opt_str("alias")?,
        color: row.get_opt_str("color")?,
        team_id: row.get_opt_i64("team_id")?,
    })
}

impl Database {
    /// Coalescing org upsert: `None` fields never overwrite stored values,
    /// and an all-null patch is a no-op.
    pub fn upsert_org(&self, server_id: &str, patch: &OrgPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.execute(
            &UPSERT_ORG,
            &sql_params![
                server_id,
                patch.company_name.clone(),
                patch.alias.clone(),
                patch.color.clone(),
                patch.team_id
            ],
        )?;
        Ok(())
    }

    /// Ingest-side shortcut: record the company name a client reported.
    pub fn upsert_org_company(&self, server_id: &str, company_name: &str) -> Result<()> {
        self.upsert_org(
            server_id,
            &OrgPatch {
                company_name: Some(company_name.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn get_org(&self, server_id: &str) -> Result<Option<Org>> {
        self.query_one(&GET_ORG, &sql_params![server_id])?
            .map(|row| row_to_org(&row))
            .transpose()
    }

    pub fn list_orgs(&self) -> Result<Vec<Org>> {
        let rows = self.query(
            &Sql::same(
                "SELECT server_id, company_name, alias, color, team_id FROM orgs ORDER BY server_id",
            ),
            &[],
        )?;
        rows.iter().map(row_to_org).collect()
    }

    /// Reassign an org to a team and rewrite the `team_id` snapshot on
    /// every event of that org, so team analytics follow the move.
    pub fn move_org_to_team(&self, server_id: &str, team_id: Option<i64>) -> Result<u64> {
        self.execute(&MOVE_ORG_TO_TEAM, &sql_params![server_id, team_id])?;
        self.recalculate_team_ids_for_org(server_id)
    }

    /// Rewrite `telemetry_events.team_id` for every event of an org from
    /// the org's current assignment. Returns the number of rows rewritten.
    pub fn recalculate_team_ids_for_org(&self, server_id: &str) -> Result<u64> {
        let affected = self.execute(&RECALCULATE_EVENT_TEAMS, &sql_params![server_id])?;
        tracing::info!(server_id, affected, "Recalculated event team snapshots");
        Ok(affected)
    }
}

// ============================================
// Operator accounts and login audit
// ============================================

const INSERT_SYSTEM_USER: Sql = Sql {
    sqlite: "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, ?3) RETURNING id",
    postgres: "INSERT INTO users (username, password_hash, role) VALUES ($1, $2, $3) RETURNING id",
};

const GET_SYSTEM_USER: Sql = Sql {
    sqlite: "SELECT id, username, password_hash, role, last_login FROM users WHERE username = ?1",
    postgres: "SELECT id, username, password_hash, role, last_login FROM users WHERE username = $1",
};

const GET_SYSTEM_USER_BY_ID: Sql = Sql {
    sqlite: "SELECT id, username, password_hash, role, last_login FROM users WHERE id = ?1",
    postgres: "SELECT id, username, password_hash, role, last_login FROM users WHERE id = $1",
};

const TOUCH_LAST_LOGIN: Sql = Sql {
    sqlite: "UPDATE users SET last_login = ?2 WHERE id = ?1",
    postgres: "UPDATE users SET last_login = $2 WHERE id = $1",
};

const INSERT_LOGIN_AUDIT: Sql = Sql {
    sqlite: "INSERT INTO login_audit (username, success, ip, user_agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
    postgres: "INSERT INTO login_audit (username, success, ip, user_agent, created_at)
               VALUES ($1, $2, $3::text::inet, $4, $5)",
};

const LIST_LOGIN_AUDIT: Sql = Sql {
    sqlite: "SELECT id, username, success, ip, user_agent, created_at
             FROM login_audit ORDER BY created_at DESC, id DESC LIMIT ?1",
    postgres: "SELECT id, username, success, ip::text AS ip, user_agent, created_at
               FROM login_audit ORDER BY created_at DESC, id DESC LIMIT $1",
};

fn row_to_system_user(row: &SqlRow) -> Result<SystemUser> {
    Ok(SystemUser {
        id: row.get_i64("id")?,
        username: row.get_str("username")?,
        password_hash: row.get_str("password_hash")?,
        role: Role::parse_lenient(&row.get_str("role")?),
        last_login: row.get_opt_datetime("last_login")?,
    })
}

impl Database {
    pub fn create_system_user(&self, username: &str, password: &str, role: Role) -> Result<i64> {
        let hash = hash_password(password)?;
        self.insert(&INSERT_SYSTEM_USER, &sql_params![username, hash, role.as_str()])
    }

    pub fn get_system_user(&self, username: &str) -> Result<Option<SystemUser>> {
        self.query_one(&GET_SYSTEM_USER, &sql_params![username])?
            .map(|row| row_to_system_user(&row))
            .transpose()
    }

    /// Verify a password login, stamping `last_login` and appending to the
    /// audit log either way.
    pub fn verify_login(
        &self,
        username: &str,
        password: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Option<SystemUser>> {
        let user = self.get_system_user(username)?;
        let verified = user
            .as_ref()
            .filter(|u| verify_password(password, &u.password_hash))
            .cloned();

        self.record_login_audit(username, verified.is_some(), ip, user_agent)?;

        if let Some(user) = &verified {
            self.execute(&TOUCH_LAST_LOGIN, &sql_params![user.id, Utc::now()])?;
        }
        Ok(verified)
    }

    /// Append-only authentication log.
    pub fn record_login_audit(
        &self,
        username: &str,
        success: bool,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<()> {
        self.execute(
            &INSERT_LOGIN_AUDIT,
            &sql_params![
                username,
                success,
                ip.map(str::to_string),
                user_agent.map(str::to_string),
                Utc::now()
            ],
        )?;
        Ok(())
    }

    pub fn list_login_audit(&self, limit: usize) -> Result<Vec<LoginAudit>> {
        let rows = self.query(&LIST_LOGIN_AUDIT, &sql_params![limit.clamp(1, 1000)])?;
        rows.iter()
            .map(|row| {
                Ok(LoginAudit {
                    id: row.get_i64("id")?,
                    username: row.get_str("username")?,
                    success: row.get_bool("success")?,
                    ip: row.get_opt_str("ip")?,
                    user_agent: row.get_opt_str("user_agent")?,
                    created_at: row.get_datetime("created_at")?,
                })
            })
            .collect()
    }
}

// ============================================
// Remember tokens
// ============================================

const INSERT_TOKEN: Sql = Sql {
    sqlite: "INSERT INTO remember_tokens (user_id, token_hash, expires_at, user_agent, ip, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
    postgres: "INSERT INTO remember_tokens (user_id, token_hash, expires_at, user_agent, ip, created_at)
               VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
};

const FIND_LIVE_TOKEN: Sql = Sql {
    sqlite: "SELECT id, user_id, token_hash, expires_at, revoked_at, user_agent, ip, created_at
             FROM remember_tokens
             WHERE token_hash = ?1 AND expires_at > ?2 AND revoked_at IS NULL",
    postgres: "SELECT id, user_id, token_hash, expires_at, revoked_at, user_agent, ip, created_at
               FROM remember_tokens
               WHERE token_hash = $1 AND expires_at > $2 AND revoked_at IS NULL",
};

const REVOKE_TOKEN: Sql = Sql {
    sqlite: "UPDATE remember_tokens SET revoked_at = ?2
             WHERE token_hash = ?1 AND revoked_at IS NULL",
    postgres: "UPDATE remember_tokens SET revoked_at = $2
               WHERE token_hash = $1 AND revoked_at IS NULL",
};

const REVOKE_USER_TOKENS: Sql = Sql {
    sqlite: "UPDATE remember_tokens SET revoked_at = ?2
             WHERE user_id = ?1 AND revoked_at IS NULL",
    postgres: "UPDATE remember_tokens SET revoked_at = $2
               WHERE user_id = $1 AND revoked_at IS NULL",
};

fn row_to_token(row: &SqlRow) -> Result<RememberToken> {
    Ok(RememberToken {
        id: row.get_i64("id")?,
        user_id: row.get_i64("user_id")?,
        token_hash: row.get_str("token_hash")?,
        expires_at: row.get_datetime("expires_at")?,
        revoked_at: row.get_opt_datetime("revoked_at")?,
        user_agent: row.get_opt_str("user_agent")?,
        ip: row.get_opt_str("ip")?,
        created_at: row.get_datetime("created_at")?,
    })
}

impl Database {
    /// Issue a remember token for an operator. The returned plaintext is
    /// shown exactly once; only its SHA-256 is stored.
    pub fn issue_remember_token(
        &self,
        user_id: i64,
        valid_for_days: i64,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> Result<String> {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.insert(
            &INSERT_TOKEN,
            &sql_params![
                user_id,
                token_hash(&token),
                Utc::now() + Duration::days(valid_for_days.max(1)),
                user_agent.map(str::to_string),
                ip.map(str::to_string),
                Utc::now()
            ],
        )?;
        Ok(token)
    }

    /// Look up a presented token by its hash. Constant-time-safe: the
    /// input is hashed and matched against stored digests only; no
    /// plaintext comparison happens.
    pub fn validate_remember_token(&self, token: &str) -> Result<Option<SystemUser>> {
        let Some(row) = self.query_one(
            &FIND_LIVE_TOKEN,
            &sql_params![token_hash(token), Utc::now()],
        )?
        else {
            return Ok(None);
        };
        let token = row_to_token(&row)?;
        self.query_one(&GET_SYSTEM_USER_BY_ID, &sql_params![token.user_id])?
            .map(|row| row_to_system_user(&row))
            .transpose()
    }

    /// Revoke one token. Returns false when it was unknown or already
    /// revoked.
    pub fn revoke_remember_token(&self, token: &str) -> Result<bool> {
        let affected = self.execute(&REVOKE_TOKEN, &sql_params![token_hash(token), Utc::now()])?;
        Ok(affected > 0)
    }

    /// Revoke every live token of an operator.
    pub fn revoke_user_tokens(&self, user_id: i64) -> Result<u64> {
        self.execute(&REVOKE_USER_TOKENS, &sql_params![user_id, Utc::now()])
    }

    /// Rotate a token: revoke the presented one and issue a replacement
    /// for the same operator. Returns `None` when the token is not valid.
    pub fn rotate_remember_token(
        &self,
        token: &str,
        valid_for_days: i64,
        user_agent: Option<&str>,
        ip: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(user) = self.validate_remember_token(token)? else {
            return Ok(None);
        };
        self.revoke_remember_token(token)?;
        self.issue_remember_token(user.id, valid_for_days, user_agent, ip)
            .map(Some)
    }
}

// ============================================
// Settings
// ============================================

const UPSERT_SETTING: Sql = Sql {
    sqlite: "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    postgres: "INSERT INTO settings (key, value) VALUES ($1, $2)
               ON CONFLICT (key) DO UPDATE SET value = excluded.value",
};

const GET_SETTING: Sql = Sql {
    sqlite: "SELECT key, value FROM settings WHERE key = ?1",
    postgres: "SELECT key, value FROM settings WHERE key = $1",
};

impl Database {
    /// Last-write-wins key/value configuration store.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.execute(&UPSERT_SETTING, &sql_params![key, value])?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.query_one(&GET_SETTING, &sql_params![key])?
            .map(|row| row.get_str("value"))
            .transpose()
    }

    pub fn list_settings(&self) -> Result<Vec<Setting>> {
        let rows = self.query(&Sql::same("SELECT key, value FROM settings ORDER BY key"), &[])?;
        rows.iter()
            .map(|row| {
                Ok(Setting {
                    key: row.get_str("key")?,
                    value: row.get_str("value")?,
                })
            })
            .collect()
    }
}
