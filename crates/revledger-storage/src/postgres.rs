//! Postgres-backed canonical store.
//!
//! Every table shares the leading columns `id, company_id, natural_key`; the
//! per-entity columns come from [`PgEntity`], so one repository impl serves all
//! twelve tables.

use async_trait::async_trait;
use revledger_core::{
    Company, CrmAppointment, CrmContact, CrmOpportunity, CrmPipeline, CrmPipelineStage,
    ElectiveSale, Entity, FanbasisSale, Membership, Payment, SheetRow, User,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{ensure_company, EntityRepository, SheetRowRepository, StoreError};

const BIND_LIMIT: usize = 65_535;
const BASE_COLUMNS: [&str; 3] = ["id", "company_id", "natural_key"];

/// Row mapping for one canonical table.
pub trait PgEntity: Entity + Unpin {
    const TABLE: &'static str;
    /// Columns after the shared `id, company_id, natural_key` prefix, in bind order.
    const COLUMNS: &'static [&'static str];

    fn bind_columns<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>);

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("canonical store migrations applied");
        Ok(())
    }
}

fn column_list<E: PgEntity>() -> String {
    BASE_COLUMNS
        .iter()
        .chain(E::COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

fn rows_per_statement<E: PgEntity>() -> usize {
    (BIND_LIMIT / (BASE_COLUMNS.len() + E::COLUMNS.len())).max(1)
}

async fn insert_rows<E: PgEntity>(conn: &mut PgConnection, rows: &[E]) -> Result<usize, StoreError> {
    let mut inserted = 0usize;
    for chunk in rows.chunks(rows_per_statement::<E>()) {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", E::TABLE, column_list::<E>()));
        qb.push_values(chunk.iter(), |mut b, row| {
            b.push_bind(row.id())
                .push_bind(row.company_id())
                .push_bind(row.natural_key());
            row.bind_columns(&mut b);
        });
        let result = qb.build().execute(&mut *conn).await.map_err(|err| {
            conflict_or_database::<E>(err, chunk.first().map(|r| r.company_id()))
        })?;
        inserted += result.rows_affected() as usize;
    }
    Ok(inserted)
}

fn conflict_or_database<E: PgEntity>(err: sqlx::Error, company_id: Option<Uuid>) -> StoreError {
    if let (sqlx::Error::Database(db), Some(company_id)) = (&err, company_id) {
        if db.is_unique_violation() {
            return StoreError::Conflict {
                kind: E::KIND,
                company_id,
                key: db.constraint().unwrap_or("natural_key").to_string(),
            };
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl<E: PgEntity> EntityRepository<E> for PgStore {
    async fn find_by_keys(&self, company_id: Uuid, keys: &[String]) -> Result<Vec<E>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE company_id = $1 AND natural_key = ANY($2)",
            column_list::<E>(),
            E::TABLE
        );
        let rows = sqlx::query(&sql)
            .bind(company_id)
            .bind(keys.to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(E::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn insert_many(&self, rows: Vec<E>) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let inserted = insert_rows(&mut *tx, &rows).await?;
        tx.commit().await?;
        debug!(kind = E::KIND, inserted, "inserted rows");
        Ok(inserted)
    }

    async fn update(&self, row: &E) -> Result<(), StoreError> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "UPDATE {} SET (natural_key, {}) = ROW (",
            E::TABLE,
            E::COLUMNS.join(", ")
        ));
        {
            let mut values = qb.separated(", ");
            values.push_bind(row.natural_key());
            row.bind_columns(&mut values);
        }
        qb.push(") WHERE id = ")
            .push_bind(row.id())
            .push(" AND company_id = ")
            .push_bind(row.company_id());

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        let owner: Option<Uuid> = sqlx::query_scalar(&format!(
            "SELECT company_id FROM {} WHERE id = $1",
            E::TABLE
        ))
        .bind(row.id())
        .fetch_optional(&self.pool)
        .await?;
        match owner {
            Some(actual) => Err(StoreError::TenantMismatch {
                kind: E::KIND,
                expected: row.company_id(),
                actual,
            }),
            None => Err(StoreError::NotFound {
                kind: E::KIND,
                id: row.id(),
            }),
        }
    }

    async fn list(&self, companies: Option<&[Uuid]>) -> Result<Vec<E>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE ($1::uuid[] IS NULL OR company_id = ANY($1)) \
             ORDER BY company_id, natural_key",
            column_list::<E>(),
            E::TABLE
        );
        let rows = sqlx::query(&sql)
            .bind(companies.map(<[Uuid]>::to_vec))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(E::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl SheetRowRepository for PgStore {
    async fn replace_for_company(
        &self,
        company_id: Uuid,
        rows: Vec<SheetRow>,
    ) -> Result<usize, StoreError> {
        for row in &rows {
            ensure_company(row, company_id)?;
        }
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM sheet_rows WHERE company_id = $1")
            .bind(company_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let inserted = insert_rows(&mut *tx, &rows).await?;
        tx.commit().await?;
        debug!(%company_id, deleted, inserted, "sheet rows replaced");
        Ok(inserted)
    }
}

impl PgEntity for Company {
    const TABLE: &'static str = "companies";
    const COLUMNS: &'static [&'static str] = &[
        "name",
        "payments_company_ref",
        "crm_location_id",
        "sheet_url",
        "created_at",
        "updated_at",
    ];

    fn bind_columns<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values
            .push_bind(self.name.clone())
            .push_bind(self.payments_company_ref.clone())
            .push_bind(self.crm_location_id.clone())
            .push_bind(self.sheet_url.clone())
            .push_bind(self.created_at)
            .push_bind(self.updated_at);
    }

    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Company {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            payments_company_ref: row.try_get("payments_company_ref")?,
            crm_location_id: row.try_get("crm_location_id")?,
            sheet_url: row.try_get("sheet_url")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Implements [`PgEntity`] for a tenant-scoped record whose column names match its fields.
macro_rules! pg_entity {
    ($ty:ident, $table:literal, [$($col:ident),+ $(,)?]) => {
        impl PgEntity for $ty {
            const TABLE: &'static str = $table;
            const COLUMNS: &'static [&'static str] = &[$(stringify!($col)),+];

            fn bind_columns<'args>(
                &self,
                values: &mut Separated<'_, 'args, Postgres, &'static str>,
            ) {
                $( values.push_bind(self.$col.clone()); )+
            }

            fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
                Ok($ty {
                    id: row.try_get("id")?,
                    company_id: row.try_get("company_id")?,
                    $( $col: row.try_get(stringify!($col))?, )+
                })
            }
        }
    };
}

pg_entity!(User, "users", [email, name, username, external_payment_id, created_at, updated_at]);
pg_entity!(
    Payment,
    "payments",
    [
        user_id,
        external_id,
        amount,
        amount_before_fees,
        refunded_amount,
        currency,
        status,
        sub_status,
        product,
        customer_email,
        occurred_at,
    ]
);
pg_entity!(
    Membership,
    "memberships",
    [
        user_id,
        external_id,
        status,
        product,
        customer_email,
        cancel_at_period_end,
        renewal_period_end,
        created_at,
    ]
);
pg_entity!(
    SheetRow,
    "sheet_rows",
    [
        user_id,
        row_number,
        entry_date,
        entry_type,
        amount,
        contact_name,
        contact_email,
        platform,
        closer,
        setter,
        notes,
    ]
);
pg_entity!(
    ElectiveSale,
    "elective_sales",
    [user_id, sale_date, customer_email, customer_name, net_amount]
);
pg_entity!(
    FanbasisSale,
    "fanbasis_sales",
    [
        user_id,
        sale_date,
        customer_email,
        customer_name,
        amount,
        net_amount,
        status,
        product,
        discount_code,
        discount_amount,
        payment_method,
    ]
);
pg_entity!(
    CrmContact,
    "crm_contacts",
    [user_id, external_id, first_name, last_name, email, phone, tags, created_at]
);
pg_entity!(
    CrmOpportunity,
    "crm_opportunities",
    [
        contact_id,
        contact_external_id,
        external_id,
        name,
        status,
        monetary_value,
        pipeline_id,
        stage_id,
        assigned_to,
        created_at,
    ]
);
pg_entity!(
    CrmAppointment,
    "crm_appointments",
    [contact_id, external_id, title, status, start_time, end_time, assigned_user_id]
);
pg_entity!(CrmPipeline, "crm_pipelines", [external_id, name]);
pg_entity!(
    CrmPipelineStage,
    "crm_pipeline_stages",
    [pipeline_id, pipeline_external_id, external_id, name, position]
);
