use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::sql_types::Bool;

use crate::db::manager::Pool;
use crate::db::schema::{roles, user_roles, users};

use super::{
    DatabaseError,
    models::{
        NewRole, NewUser, Role, RoleChanges, RoleFilter, User, UserChanges, UserFilter,
        search_pattern,
    },
};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(Pg))]
struct DbUser {
    id: i64,
    email: String,
    username: String,
    first_name: Option<String>,
    last_name: Option<String>,
    hashed_password: String,
    tenant_id: String,
    is_active: bool,
    is_verified: bool,
    is_superuser: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DbUser {
    fn into_user(self, roles: Vec<Role>) -> User {
        User {
            id: self.id,
            email: self.email,
            username: self.username,
            first_name: self.first_name,
            last_name: self.last_name,
            hashed_password: self.hashed_password,
            tenant_id: self.tenant_id,
            is_active: self.is_active,
            is_verified: self.is_verified,
            is_superuser: self.is_superuser,
            created_at: self.created_at,
            updated_at: self.updated_at,
            roles,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
struct InsertUser<'a> {
    email: &'a str,
    username: &'a str,
    first_name: Option<&'a str>,
    last_name: Option<&'a str>,
    hashed_password: &'a str,
    tenant_id: &'a str,
    is_active: bool,
    is_verified: bool,
    is_superuser: bool,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = users)]
struct UpdateUser<'a> {
    email: Option<&'a str>,
    username: Option<&'a str>,
    first_name: Option<Option<&'a str>>,
    last_name: Option<Option<&'a str>>,
    hashed_password: Option<&'a str>,
    is_active: Option<bool>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = roles)]
#[diesel(check_for_backend(Pg))]
struct DbRole {
    id: i64,
    name: String,
    description: Option<String>,
    permissions: String,
    is_system_role: bool,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DbRole {
    fn to_role(&self) -> Result<Role, DatabaseError> {
        Ok(Role {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            permissions: serde_json::from_str(&self.permissions)?,
            is_system_role: self.is_system_role,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = roles)]
struct InsertRole<'a> {
    name: &'a str,
    description: Option<&'a str>,
    permissions: String,
    is_system_role: bool,
    is_active: bool,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = roles)]
struct UpdateRole<'a> {
    name: Option<&'a str>,
    description: Option<Option<&'a str>>,
    permissions: Option<String>,
    is_active: Option<bool>,
    updated_at: &'a DateTime<Utc>,
}

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

fn filtered_users(filter: &UserFilter) -> users::BoxedQuery<'static, Pg> {
    let mut query = users::table.into_boxed::<Pg>();

    if let Some(tenant) = filter.tenant_id.clone() {
        query = query.filter(users::tenant_id.eq(tenant));
    }
    if let Some(active) = filter.is_active {
        query = query.filter(users::is_active.eq(active));
    }
    if let Some(superuser) = filter.is_superuser {
        query = query.filter(users::is_superuser.eq(superuser));
    }
    // Backslash is the default LIKE escape in PostgreSQL.
    if let Some(pattern) = search_pattern(filter.search.as_deref()) {
        query = query.filter(
            users::email
                .ilike(pattern.clone())
                .or(users::username.ilike(pattern.clone()))
                .or(users::first_name.ilike(pattern.clone()))
                .or(users::last_name.ilike(pattern)),
        );
    }

    query
}

fn filtered_roles(filter: &RoleFilter) -> roles::BoxedQuery<'static, Pg> {
    let mut query = roles::table.into_boxed::<Pg>();

    if let Some(active) = filter.is_active {
        query = query.filter(roles::is_active.eq(active));
    }
    if let Some(pattern) = search_pattern(filter.search.as_deref()) {
        query = query.filter(
            roles::name
                .ilike(pattern.clone())
                .or(roles::description.ilike(pattern)),
        );
    }

    query
}

fn roles_by_user(
    conn: &mut PgConnection,
    user_ids: &[i64],
) -> Result<HashMap<i64, Vec<Role>>, DatabaseError> {
    let rows = user_roles::table
        .inner_join(roles::table)
        .filter(user_roles::user_id.eq_any(user_ids.to_vec()))
        .order(roles::id.asc())
        .select((user_roles::user_id, DbRole::as_select()))
        .load::<(i64, DbRole)>(conn)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    let mut grouped: HashMap<i64, Vec<Role>> = HashMap::new();
    for (user_id, role) in rows {
        grouped.entry(user_id).or_default().push(role.to_role()?);
    }
    Ok(grouped)
}

fn attach_roles(conn: &mut PgConnection, rows: Vec<DbUser>) -> Result<Vec<User>, DatabaseError> {
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    let mut grouped = roles_by_user(conn, &ids)?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let roles = grouped.remove(&row.id).unwrap_or_default();
            row.into_user(roles)
        })
        .collect())
}

type UserPredicate = Box<dyn BoxableExpression<users::table, Pg, SqlType = Bool>>;

fn load_user(
    conn: &mut PgConnection,
    predicate: UserPredicate,
) -> Result<Option<User>, DatabaseError> {
    let row = users::table
        .into_boxed::<Pg>()
        .filter(predicate)
        .select(DbUser::as_select())
        .first::<DbUser>(conn)
        .optional()
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

    match row {
        Some(row) => Ok(attach_roles(conn, vec![row])?.pop()),
        None => Ok(None),
    }
}

fn link_roles(conn: &mut PgConnection, user_id: i64, role_ids: &[i64]) -> Result<(), DatabaseError> {
    let mut seen = Vec::with_capacity(role_ids.len());
    for role_id in role_ids {
        if seen.contains(role_id) {
            continue;
        }
        seen.push(*role_id);
        diesel::insert_into(user_roles::table)
            .values((
                user_roles::user_id.eq(user_id),
                user_roles::role_id.eq(*role_id),
            ))
            .on_conflict_do_nothing()
            .execute(conn)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
    }
    Ok(())
}

fn missing_row(kind: &str) -> DatabaseError {
    DatabaseError::Query(format!("{kind} row vanished after write"))
}

pub struct PostgresUserStore {
    pool: Pool,
}

impl PostgresUserStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::UserStore for PostgresUserStore {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            load_user(conn, Box::new(users::id.eq(user_id)))
        })
        .await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let pool = self.pool.clone();
        let email = email.to_lowercase();
        with_connection(pool, move |conn| {
            load_user(conn, Box::new(users::email.eq(email)))
        })
        .await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        let pool = self.pool.clone();
        let username = username.to_lowercase();
        with_connection(pool, move |conn| {
            load_user(conn, Box::new(users::username.eq(username)))
        })
        .await
    }

    async fn list_users(
        &self,
        filter: &UserFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<User>, DatabaseError> {
        let pool = self.pool.clone();
        let filter = filter.clone();
        with_connection(pool, move |conn| {
            let rows = filtered_users(&filter)
                .order(users::id.asc())
                .offset(offset)
                .limit(limit)
                .select(DbUser::as_select())
                .load::<DbUser>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            attach_roles(conn, rows)
        })
        .await
    }

    async fn count_users(&self, filter: &UserFilter) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        let filter = filter.clone();
        with_connection(pool, move |conn| {
            filtered_users(&filter)
                .count()
                .get_result::<i64>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn create_user(&self, user: &NewUser, role_ids: &[i64]) -> Result<User, DatabaseError> {
        let pool = self.pool.clone();
        let user = user.clone();
        let role_ids = role_ids.to_vec();
        with_connection(pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                let now = Utc::now();
                let row = InsertUser {
                    email: &user.email,
                    username: &user.username,
                    first_name: user.first_name.as_deref(),
                    last_name: user.last_name.as_deref(),
                    hashed_password: &user.hashed_password,
                    tenant_id: &user.tenant_id,
                    is_active: user.is_active,
                    is_verified: user.is_verified,
                    is_superuser: user.is_superuser,
                    created_at: &now,
                    updated_at: &now,
                };

                let user_id = diesel::insert_into(users::table)
                    .values(&row)
                    .returning(users::id)
                    .get_result::<i64>(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;

                link_roles(conn, user_id, &role_ids)?;
                load_user(conn, Box::new(users::id.eq(user_id)))?
                    .ok_or_else(|| missing_row("user"))
            })
        })
        .await
    }

    async fn update_user(
        &self,
        user_id: i64,
        changes: &UserChanges,
        role_ids: Option<&[i64]>,
    ) -> Result<Option<User>, DatabaseError> {
        let pool = self.pool.clone();
        let changes = changes.clone();
        let role_ids = role_ids.map(<[i64]>::to_vec);
        with_connection(pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                let now = Utc::now();
                let update = UpdateUser {
                    email: changes.email.as_deref(),
                    username: changes.username.as_deref(),
                    first_name: changes.first_name.as_ref().map(|v| v.as_deref()),
                    last_name: changes.last_name.as_ref().map(|v| v.as_deref()),
                    hashed_password: changes.hashed_password.as_deref(),
                    is_active: changes.is_active,
                    updated_at: &now,
                };

                let updated = diesel::update(users::table.find(user_id))
                    .set(&update)
                    .execute(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                if updated == 0 {
                    return Ok(None);
                }

                if let Some(role_ids) = role_ids {
                    diesel::delete(user_roles::table.filter(user_roles::user_id.eq(user_id)))
                        .execute(conn)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?;
                    link_roles(conn, user_id, &role_ids)?;
                }

                load_user(conn, Box::new(users::id.eq(user_id)))
            })
        })
        .await
    }

    async fn delete_user(&self, user_id: i64) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                diesel::delete(user_roles::table.filter(user_roles::user_id.eq(user_id)))
                    .execute(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                let deleted = diesel::delete(users::table.find(user_id))
                    .execute(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(deleted > 0)
            })
        })
        .await
    }

    async fn add_user_role(&self, user_id: i64, role_id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| link_roles(conn, user_id, &[role_id])).await
    }

    async fn remove_user_role(&self, user_id: i64, role_id: i64) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            diesel::delete(user_roles::table.find((user_id, role_id)))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct PostgresRoleStore {
    pool: Pool,
}

impl PostgresRoleStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn load_role_by_id(conn: &mut PgConnection, role_id: i64) -> Result<Option<Role>, DatabaseError> {
    roles::table
        .find(role_id)
        .select(DbRole::as_select())
        .first::<DbRole>(conn)
        .optional()
        .map_err(|e| DatabaseError::Query(e.to_string()))?
        .map(|row| row.to_role())
        .transpose()
}

#[async_trait]
impl super::RoleStore for PostgresRoleStore {
    async fn get_role(&self, role_id: i64) -> Result<Option<Role>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| load_role_by_id(conn, role_id)).await
    }

    async fn get_role_by_name(&self, name: &str) -> Result<Option<Role>, DatabaseError> {
        let pool = self.pool.clone();
        let name = name.to_lowercase();
        with_connection(pool, move |conn| {
            roles::table
                .filter(roles::name.eq(name))
                .select(DbRole::as_select())
                .first::<DbRole>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(|row| row.to_role())
                .transpose()
        })
        .await
    }

    async fn get_roles_by_ids(&self, ids: &[i64]) -> Result<Vec<Role>, DatabaseError> {
        let pool = self.pool.clone();
        let ids = ids.to_vec();
        with_connection(pool, move |conn| {
            roles::table
                .filter(roles::id.eq_any(ids))
                .order(roles::id.asc())
                .select(DbRole::as_select())
                .load::<DbRole>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .iter()
                .map(DbRole::to_role)
                .collect()
        })
        .await
    }

    async fn list_roles(
        &self,
        filter: &RoleFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Role>, DatabaseError> {
        let pool = self.pool.clone();
        let filter = filter.clone();
        with_connection(pool, move |conn| {
            filtered_roles(&filter)
                .order(roles::id.asc())
                .offset(offset)
                .limit(limit)
                .select(DbRole::as_select())
                .load::<DbRole>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .iter()
                .map(DbRole::to_role)
                .collect()
        })
        .await
    }

    async fn count_roles(&self, filter: &RoleFilter) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        let filter = filter.clone();
        with_connection(pool, move |conn| {
            filtered_roles(&filter)
                .count()
                .get_result::<i64>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn count_system_roles(&self) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            roles::table
                .filter(roles::is_system_role.eq(true))
                .count()
                .get_result::<i64>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn create_role(&self, role: &NewRole) -> Result<Role, DatabaseError> {
        let pool = self.pool.clone();
        let role = role.clone();
        with_connection(pool, move |conn| {
            let now = Utc::now();
            let row = InsertRole {
                name: &role.name,
                description: role.description.as_deref(),
                permissions: serde_json::to_string(&role.permissions)?,
                is_system_role: role.is_system_role,
                is_active: role.is_active,
                created_at: &now,
                updated_at: &now,
            };

            let role_id = diesel::insert_into(roles::table)
                .values(&row)
                .returning(roles::id)
                .get_result::<i64>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

            load_role_by_id(conn, role_id)?.ok_or_else(|| missing_row("role"))
        })
        .await
    }

    async fn update_role(
        &self,
        role_id: i64,
        changes: &RoleChanges,
    ) -> Result<Option<Role>, DatabaseError> {
        let pool = self.pool.clone();
        let changes = changes.clone();
        with_connection(pool, move |conn| {
            let now = Utc::now();
            let permissions = changes
                .permissions
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let update = UpdateRole {
                name: changes.name.as_deref(),
                description: changes.description.as_ref().map(|v| v.as_deref()),
                permissions,
                is_active: changes.is_active,
                updated_at: &now,
            };

            let updated = diesel::update(roles::table.find(role_id))
                .set(&update)
                .execute(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            if updated == 0 {
                return Ok(None);
            }

            load_role_by_id(conn, role_id)
        })
        .await
    }

    async fn delete_role(&self, role_id: i64) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            conn.transaction::<_, DatabaseError, _>(|conn| {
                diesel::delete(user_roles::table.filter(user_roles::role_id.eq(role_id)))
                    .execute(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                let deleted = diesel::delete(roles::table.find(role_id))
                    .execute(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(deleted > 0)
            })
        })
        .await
    }

    async fn count_role_users(&self, role_id: i64) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            user_roles::table
                .filter(user_roles::role_id.eq(role_id))
                .count()
                .get_result::<i64>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}
