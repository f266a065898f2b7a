use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_carts_table::Migration),
            Box::new(m20240601_000002_create_payment_orders_table::Migration),
            Box::new(m20240601_000003_create_bookings_table::Migration),
            Box::new(m20240601_000004_create_payment_webhooks_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240601_000001_create_carts_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_carts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Carts::Id)
                                .string_len(100)
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Carts::UserId).string().not_null())
                        .col(ColumnDef::new(Carts::ServiceRef).string().not_null())
                        .col(ColumnDef::new(Carts::PackageRef).string().null())
                        .col(ColumnDef::new(Carts::AddressRef).string().null())
                        .col(ColumnDef::new(Carts::SelectedDate).date().not_null())
                        .col(ColumnDef::new(Carts::SelectedTime).string_len(100).not_null())
                        .col(ColumnDef::new(Carts::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Carts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Carts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_user_status_created")
                        .table(Carts::Table)
                        .col(Carts::UserId)
                        .col(Carts::Status)
                        .col(Carts::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Carts {
        Table,
        Id,
        UserId,
        ServiceRef,
        PackageRef,
        AddressRef,
        SelectedDate,
        SelectedTime,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_payment_orders_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_payment_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // cart_id is a weak reference: no foreign key, carts may be deleted by retention
            manager
                .create_table(
                    Table::create()
                        .table(PaymentOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentOrders::MerchantOrderId)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentOrders::UserId).string().not_null())
                        .col(ColumnDef::new(PaymentOrders::CartId).string_len(100).null())
                        .col(ColumnDef::new(PaymentOrders::Amount).big_integer().not_null())
                        .col(
                            ColumnDef::new(PaymentOrders::Currency)
                                .string_len(3)
                                .not_null()
                                .default("INR"),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::Status)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentOrders::GatewayOrderId).string().null())
                        .col(
                            ColumnDef::new(PaymentOrders::GatewayTransactionId)
                                .string()
                                .null(),
                        )
                        .col(ColumnDef::new(PaymentOrders::GatewayResponse).json().null())
                        .col(ColumnDef::new(PaymentOrders::FailureReason).text().null())
                        .col(ColumnDef::new(PaymentOrders::RedirectUrl).text().null())
                        .col(
                            ColumnDef::new(PaymentOrders::CheckAttempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(PaymentOrders::LastCheckError).text().null())
                        .col(
                            ColumnDef::new(PaymentOrders::LastCheckedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::NeedsReview)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(PaymentOrders::ReviewReason).text().null())
                        .col(
                            ColumnDef::new(PaymentOrders::PollLeaseUntil)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_orders_status_created")
                        .table(PaymentOrders::Table)
                        .col(PaymentOrders::Status)
                        .col(PaymentOrders::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_orders_cart_id")
                        .table(PaymentOrders::Table)
                        .col(PaymentOrders::CartId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_orders_gateway_order_id")
                        .table(PaymentOrders::Table)
                        .col(PaymentOrders::GatewayOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentOrders {
        Table,
        MerchantOrderId,
        UserId,
        CartId,
        Amount,
        Currency,
        Status,
        GatewayOrderId,
        GatewayTransactionId,
        GatewayResponse,
        FailureReason,
        RedirectUrl,
        CheckAttempts,
        LastCheckError,
        LastCheckedAt,
        NeedsReview,
        ReviewReason,
        PollLeaseUntil,
        ExpiresAt,
        CompletedAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000003_create_bookings_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_bookings_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Bookings::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Bookings::Id)
                                .string_len(32)
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Bookings::UserId).string().not_null())
                        .col(ColumnDef::new(Bookings::CartId).string_len(100).null())
                        .col(
                            ColumnDef::new(Bookings::PaymentOrderId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Bookings::ServiceRef).string().not_null())
                        .col(ColumnDef::new(Bookings::PackageRef).string().null())
                        .col(ColumnDef::new(Bookings::AddressRef).string().null())
                        .col(ColumnDef::new(Bookings::SelectedDate).date().not_null())
                        .col(
                            ColumnDef::new(Bookings::SelectedTime)
                                .string_len(100)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Bookings::Amount).big_integer().not_null())
                        .col(ColumnDef::new(Bookings::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Bookings::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Bookings::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Bookings::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // At most one booking per cart; NULLs (detached bookings) do not collide
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_bookings_cart_id")
                        .table(Bookings::Table)
                        .col(Bookings::CartId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_bookings_payment_order_id")
                        .table(Bookings::Table)
                        .col(Bookings::PaymentOrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_bookings_user_id")
                        .table(Bookings::Table)
                        .col(Bookings::UserId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Bookings::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Bookings {
        Table,
        Id,
        UserId,
        CartId,
        PaymentOrderId,
        ServiceRef,
        PackageRef,
        AddressRef,
        SelectedDate,
        SelectedTime,
        Amount,
        Currency,
        Status,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000004_create_payment_webhooks_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_payment_webhooks_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentWebhooks::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentWebhooks::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentWebhooks::EventType)
                                .string_len(100)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentWebhooks::MerchantOrderId)
                                .string_len(64)
                                .null(),
                        )
                        .col(ColumnDef::new(PaymentWebhooks::Payload).json().not_null())
                        .col(ColumnDef::new(PaymentWebhooks::Headers).json().not_null())
                        .col(
                            ColumnDef::new(PaymentWebhooks::Processed)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(PaymentWebhooks::ProcessingError).text().null())
                        .col(
                            ColumnDef::new(PaymentWebhooks::ReceivedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentWebhooks::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_webhooks_merchant_order_id")
                        .table(PaymentWebhooks::Table)
                        .col(PaymentWebhooks::MerchantOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentWebhooks::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentWebhooks {
        Table,
        Id,
        EventType,
        MerchantOrderId,
        Payload,
        Headers,
        Processed,
        ProcessingError,
        ReceivedAt,
        ProcessedAt,
    }
}
